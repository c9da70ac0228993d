use std::{
    borrow::Cow,
    fmt,
    future::{Future, IntoFuture},
    marker::PhantomData,
    sync::Arc,
};

use futures::{Stream, StreamExt};

use crate::{
    context::PropagatedContext,
    delayed::{
        Apply, DelayedFlow, Delivery, Readiness, Step, Transition, erase, restore, restore_cloned,
    },
    error::{FlowError, catch_user_fault, codes},
    executor::Executor,
    future::{Bridge, FlowFuture},
    imperative::ImperativeFlow,
};

/// 一个“可能已知、可能稍后才知道”的值。
///
/// # 设计背景（Why）
/// - 同步返回值、异步 Future、响应式流在拦截层需要被统一处理，`Flow<T>` 是三者的公共表示；
/// - 结果为三态：有值、成功但无值、失败。“尚未确定”不是结果，而是流本身的状态。
///
/// # 逻辑解析（How）
/// - 即时变体持有 [`ImperativeFlow`]，所有算子立即执行；
/// - 延迟变体持有 Step 链的尾部，算子把变换封装为新 Step 挂到尾部：
///   若上游已完成，变换在当前线程同步执行；否则由完成上游的线程执行；
/// - 传播上下文随流值静态携带，变换闭包执行期间被安装为线程环境上下文。
///
/// # 契约说明（What）
/// - 所有算子消费接收者并返回新流；
/// - 用户闭包 panic 一律转换为 `flow.user_function_panicked` 失败，绝不从算子调用处抛出；
/// - 失败短路：`map`/`flat_map`/`then` 在失败时不调用闭包，失败实例原样传递；
/// - `on_complete` 回调恰好触发一次，且在之前所有变换执行完毕之后。
///
/// # 设计取舍与风险（Trade-offs）
/// - 延迟变体以 `Box<dyn Any + Send>` 擦除每一步的类型，换取 Step 链的非泛型化；
///   每次变换会多一次分配与一次下转型；
/// - 延迟 `flat_map` 拼接进来的子流上下文随结果沿链传递，下游闭包、回调与探测快照都能看到；
///   [`Flow::context`] 只反映链式调用时已知的条目。
pub struct Flow<T> {
    repr: Repr<T>,
}

enum Repr<T> {
    Imperative(ImperativeFlow<T>),
    Delayed {
        tail: Arc<Step>,
        context: PropagatedContext,
        _marker: PhantomData<fn() -> T>,
    },
}

impl<T: Send + 'static> Flow<T> {
    /// 以值构造已完成的流。
    pub fn just(value: T) -> Self {
        Self::from_result(Ok(Some(value)))
    }

    /// 构造“成功但无值”的流。
    pub fn empty() -> Self {
        Self::from_result(Ok(None))
    }

    /// 构造失败的流。
    pub fn error(error: FlowError) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(outcome: Result<Option<T>, FlowError>) -> Self {
        Self::from(ImperativeFlow::new(outcome))
    }

    pub(crate) fn from_step(tail: Arc<Step>, context: PropagatedContext) -> Self {
        Self {
            repr: Repr::Delayed {
                tail,
                context,
                _marker: PhantomData,
            },
        }
    }

    /// 在执行器上运行 `supplier`，以其返回的流完成结果。
    ///
    /// # 契约说明（What）
    /// - 返回的流在 `supplier` 产出的流完成时完成；
    /// - 进入流的失败先经 [`FlowError::unwrap_completion`] 剥除完成包装；
    /// - 执行器拒绝任务时直接返回 `flow.executor_rejected` 失败流。
    pub fn supply_async<F>(executor: &dyn Executor, supplier: F) -> Self
    where
        F: FnOnce() -> Flow<T> + Send + 'static,
    {
        let delayed = DelayedFlow::create();
        let target = delayed.clone();
        let task = Box::new(move || match catch_user_fault(supplier) {
            Ok(inner) => inner.on_outcome(move |outcome| settle(&target, outcome)),
            Err(fault) => settle(&target, Err(fault)),
        });
        match executor.execute(task) {
            Ok(()) => delayed.flow(),
            Err(rejected) => Self::error(rejected),
        }
    }

    /// 在执行器上驱动 Future，以其输出完成结果。
    ///
    /// Future 在产出前被丢弃（例如运行时被关闭或任务被取消）时，流以 `flow.cancelled` 失败。
    pub fn from_future<F>(executor: &dyn Executor, future: F) -> Self
    where
        F: Future<Output = Result<T, FlowError>> + Send + 'static,
    {
        Self::from_future_outcome(executor, async move { future.await.map(Some) })
    }

    /// 在执行器上订阅流，以首个元素完成结果；空流得到“成功但无值”。
    pub fn from_publisher<S>(executor: &dyn Executor, stream: S) -> Self
    where
        S: Stream<Item = Result<T, FlowError>> + Send + 'static,
    {
        Self::from_future_outcome(executor, async move {
            let mut stream = Box::pin(stream);
            stream.next().await.transpose()
        })
    }

    /// 与 [`Flow::from_future`] 相同，但 Future 直接产出三态结果，`Ok(None)` 表示“成功但无值”。
    pub fn from_future_outcome<F>(executor: &dyn Executor, future: F) -> Self
    where
        F: Future<Output = Result<Option<T>, FlowError>> + Send + 'static,
    {
        let delayed = DelayedFlow::create();
        // 守卫在提交前构造：未被轮询就丢弃的任务同样会以取消失败完成目标流。
        let mut guard = CancelGuard {
            target: Some(delayed.clone()),
        };
        let task = async move {
            let outcome = future.await;
            if let Some(target) = guard.target.take() {
                settle(&target, outcome);
            }
        };
        match executor.spawn(Box::pin(task)) {
            Ok(()) => delayed.flow(),
            Err(rejected) => Self::error(rejected),
        }
    }

    /// 变换成功值；`None` 表示“无值”。
    pub fn map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: FnOnce(Option<T>) -> Option<U> + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// 以可失败的方式变换成功值。
    pub fn try_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: FnOnce(Option<T>) -> Result<Option<U>, FlowError> + Send + 'static,
    {
        match self.repr {
            Repr::Imperative(flow) => Flow::from(flow.try_map(f)),
            Repr::Delayed { tail, context, .. } => {
                let scope = context.clone();
                chain(
                    tail,
                    context,
                    Box::new(move |input: Delivery| {
                        let Delivery {
                            outcome,
                            context: carried,
                        } = input;
                        let outcome = restore::<T>(outcome).and_then(|value| {
                            in_context(&scope.merge(&carried), || catch_user_fault(|| f(value)))
                                .and_then(|result| result)
                        });
                        Transition::Ready(Delivery::new(erase(outcome), carried))
                    }),
                )
            }
        }
    }

    /// 以返回流的闭包变换成功值，并把该流拼接进来。
    pub fn flat_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: FnOnce(Option<T>) -> Flow<U> + Send + 'static,
    {
        match self.repr {
            Repr::Imperative(flow) => {
                let (outcome, context) = flow.into_parts();
                match outcome {
                    Ok(value) => match in_context(&context, || catch_user_fault(|| f(value))) {
                        Ok(next) => next.with_outer_context(&context),
                        Err(fault) => Flow::from(ImperativeFlow::with_context(Err(fault), context)),
                    },
                    Err(error) => Flow::from(ImperativeFlow::with_context(Err(error), context)),
                }
            }
            Repr::Delayed { tail, context, .. } => {
                let scope = context.clone();
                chain(
                    tail,
                    context,
                    Box::new(move |input: Delivery| {
                        let Delivery {
                            outcome,
                            context: carried,
                        } = input;
                        match restore::<T>(outcome) {
                            Ok(value) => match in_context(&scope.merge(&carried), || {
                                catch_user_fault(|| f(value))
                            }) {
                                Ok(next) => next.into_transition(carried),
                                Err(fault) => Transition::Ready(Delivery::new(Err(fault), carried)),
                            },
                            Err(error) => Transition::Ready(Delivery::new(Err(error), carried)),
                        }
                    }),
                )
            }
        }
    }

    /// 忽略成功值，拼接 `supplier` 产出的流；失败时短路。
    pub fn then<U, F>(self, supplier: F) -> Flow<U>
    where
        U: Send + 'static,
        F: FnOnce() -> Flow<U> + Send + 'static,
    {
        self.flat_map(move |_| supplier())
    }

    /// 仅在失败时调用 `f`，以其产出的流替换当前流。
    pub fn on_error_resume<F>(self, f: F) -> Flow<T>
    where
        F: FnOnce(FlowError) -> Flow<T> + Send + 'static,
    {
        match self.repr {
            Repr::Imperative(flow) => {
                let (outcome, context) = flow.into_parts();
                match outcome {
                    Ok(value) => Flow::from(ImperativeFlow::with_context(Ok(value), context)),
                    Err(error) => match in_context(&context, || catch_user_fault(|| f(error))) {
                        Ok(next) => next.with_outer_context(&context),
                        Err(fault) => Flow::from(ImperativeFlow::with_context(Err(fault), context)),
                    },
                }
            }
            Repr::Delayed { tail, context, .. } => {
                let scope = context.clone();
                chain(
                    tail,
                    context,
                    Box::new(move |input: Delivery| {
                        let Delivery {
                            outcome,
                            context: carried,
                        } = input;
                        match outcome {
                            Ok(value) => Transition::Ready(Delivery::new(Ok(value), carried)),
                            Err(error) => match in_context(&scope.merge(&carried), || {
                                catch_user_fault(|| f(error))
                            }) {
                                Ok(next) => next.into_transition(carried),
                                Err(fault) => Transition::Ready(Delivery::new(Err(fault), carried)),
                            },
                        }
                    }),
                )
            }
        }
    }

    /// 追加一条传播上下文条目。
    pub fn put_in_context<V>(mut self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: std::any::Any + Send + Sync,
    {
        match &mut self.repr {
            Repr::Imperative(flow) => {
                let (outcome, context) = std::mem::replace(flow, ImperativeFlow::new(Ok(None)))
                    .into_parts();
                *flow = ImperativeFlow::with_context(outcome, context.put(key, value));
            }
            Repr::Delayed { context, .. } => {
                *context = context.put(key, value);
            }
        }
        self
    }

    /// 当前流携带的传播上下文。
    pub fn context(&self) -> &PropagatedContext {
        match &self.repr {
            Repr::Imperative(flow) => flow.context(),
            Repr::Delayed { context, .. } => context,
        }
    }

    /// 注册完成回调，恰好触发一次。
    ///
    /// # 契约说明（What）
    /// - 成功时 `(value, None)`，失败时 `(None, Some(error))`；
    /// - 流已完成时在当前线程同步调用，否则在完成流的线程上调用；
    /// - 回调执行期间，流的传播上下文被安装为线程环境上下文；
    /// - 回调 panic 会被捕获并以 `warn` 级别记录，不会破坏完成线程。
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Option<T>, Option<FlowError>) + Send + 'static,
    {
        self.on_outcome(move |outcome| {
            let result = catch_user_fault(move || match outcome {
                Ok(value) => callback(value, None),
                Err(error) => callback(None, Some(error)),
            });
            if let Err(fault) = result {
                tracing::warn!(code = fault.code(), "flow completion callback panicked: {}", fault.message());
            }
        });
    }

    /// 以完整结果注册回调，内部算子共用的观察入口。
    pub(crate) fn on_outcome<F>(self, observer: F)
    where
        F: FnOnce(Result<Option<T>, FlowError>) + Send + 'static,
    {
        match self.repr {
            Repr::Imperative(flow) => {
                let (outcome, context) = flow.into_parts();
                in_context(&context, || observer(outcome));
            }
            Repr::Delayed { tail, context, .. } => {
                let observer = Arc::new(spin::Mutex::new(Some(observer)));
                let registered = Arc::clone(&observer);
                let scope = context.clone();
                let step = Arc::new(Step::with_apply(Box::new(move |input: Delivery| {
                    // 先释放锁，再调用观察者。
                    let observer = registered.lock().take();
                    if let Some(observer) = observer {
                        let Delivery {
                            outcome,
                            context: carried,
                        } = input;
                        in_context(&scope.merge(&carried), || observer(restore::<T>(outcome)));
                    }
                    Transition::Ready(Delivery::bare(Ok(None)))
                })));
                if let Err(error) = tail.attach(step) {
                    // 回调未能挂上链，直接以挂载失败通知观察者。
                    let observer = observer.lock().take();
                    if let Some(observer) = observer {
                        in_context(&context, || observer(Err(error)));
                    }
                }
            }
        }
    }

    /// 把当前流的结果转交给 `target`。
    pub fn complete_to(self, target: &DelayedFlow<T>) {
        let target = target.clone();
        self.on_outcome(move |outcome| settle(&target, outcome));
    }

    /// 非阻塞探测：已完成时返回结果快照，未完成时返回 `None`。
    ///
    /// # 契约说明（What）
    /// - 探测只读取结果，不消费它：同一个流可以反复探测，之后仍可链式调用或注册回调；
    /// - 结果已被其他读端取走时，返回 `flow.already_attached` 失败快照；
    /// - 快照上下文包含沿链拼接进来的子流条目；
    /// - 需要值可克隆；不可克隆的值改用 [`Flow::into_resolved`]。
    pub fn try_complete(&self) -> Option<ImperativeFlow<T>>
    where
        T: Clone,
    {
        match &self.repr {
            Repr::Imperative(flow) => Some(flow.clone()),
            Repr::Delayed { tail, context, .. } => {
                let peeked = tail.peek(|delivery| {
                    (
                        restore_cloned::<T>(&delivery.outcome),
                        delivery.context.clone(),
                    )
                });
                match peeked {
                    Readiness::Pending => None,
                    Readiness::Ready((outcome, carried)) => Some(ImperativeFlow::with_context(
                        outcome,
                        context.merge(&carried),
                    )),
                    Readiness::Consumed => Some(ImperativeFlow::with_context(
                        Err(FlowError::already_attached()),
                        context.clone(),
                    )),
                }
            }
        }
    }

    /// 已完成且有值时返回值的克隆；未完成、无值或失败时返回 `None`。
    pub fn try_complete_value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.try_complete().and_then(ImperativeFlow::value)
    }

    /// 已完成且失败时返回错误。
    pub fn try_complete_error(&self) -> Option<FlowError> {
        match &self.repr {
            Repr::Imperative(flow) => flow.error().cloned(),
            Repr::Delayed { tail, .. } => {
                match tail.peek(|delivery| delivery.outcome.as_ref().err().cloned()) {
                    Readiness::Ready(error) => error,
                    Readiness::Consumed => Some(FlowError::already_attached()),
                    Readiness::Pending => None,
                }
            }
        }
    }

    /// 消费式探测：已完成时取走结果，否则原样退回流。
    ///
    /// # 契约说明（What）
    /// - 适用于不可克隆的值；取走后该结果不再对其他读端可见，
    ///   其后的探测与链式调用得到 `flow.already_attached`；
    /// - 结果已被其他读端取走时返回 `flow.already_attached` 失败快照。
    pub fn into_resolved(self) -> Result<ImperativeFlow<T>, Flow<T>> {
        match self.repr {
            Repr::Imperative(flow) => Ok(flow),
            Repr::Delayed {
                tail,
                context,
                _marker,
            } => match tail.try_take_output() {
                Readiness::Ready(Delivery {
                    outcome,
                    context: carried,
                }) => Ok(ImperativeFlow::with_context(
                    restore::<T>(outcome),
                    context.merge(&carried),
                )),
                Readiness::Consumed => Ok(ImperativeFlow::with_context(
                    Err(FlowError::already_attached()),
                    context,
                )),
                Readiness::Pending => Err(Flow {
                    repr: Repr::Delayed {
                        tail,
                        context,
                        _marker,
                    },
                }),
            },
        }
    }

    /// 是否为即时变体（结果在构造时已确定）。
    pub fn is_imperative(&self) -> bool {
        matches!(self.repr, Repr::Imperative(_))
    }

    /// 转换为标准 Future。
    pub fn into_future(self) -> FlowFuture<T> {
        match self.into_resolved() {
            Ok(flow) => FlowFuture::ready(flow.into_result()),
            Err(pending) => {
                let bridge = Bridge::new();
                let resolver = Arc::clone(&bridge);
                pending.on_outcome(move |outcome| resolver.resolve(outcome));
                FlowFuture::pending(bridge)
            }
        }
    }

    /// 转换为 `apply` 的结果，供拼接子流使用。
    ///
    /// 子流上下文合并在 `carried` 之上，随结果继续向下游传递。
    fn into_transition(self, carried: PropagatedContext) -> Transition {
        match self.repr {
            Repr::Imperative(flow) => {
                let (outcome, context) = flow.into_parts();
                Transition::Ready(Delivery::new(erase(outcome), carried.merge(&context)))
            }
            Repr::Delayed { tail, context, .. } => {
                Transition::Await(tail, carried.merge(&context))
            }
        }
    }

    /// 即时拼接时合并外层上下文；子流条目优先。
    fn with_outer_context(self, outer: &PropagatedContext) -> Self {
        if outer.is_empty() {
            return self;
        }
        let mut flow = self;
        match &mut flow.repr {
            Repr::Imperative(inner) => {
                let (outcome, context) = std::mem::replace(inner, ImperativeFlow::new(Ok(None)))
                    .into_parts();
                *inner = ImperativeFlow::with_context(outcome, outer.merge(&context));
            }
            Repr::Delayed { context, .. } => {
                *context = outer.merge(context);
            }
        }
        flow
    }
}

impl<T: Send + 'static> From<ImperativeFlow<T>> for Flow<T> {
    fn from(flow: ImperativeFlow<T>) -> Self {
        Self {
            repr: Repr::Imperative(flow),
        }
    }
}

impl<T: Send + 'static> IntoFuture for Flow<T> {
    type Output = Result<Option<T>, FlowError>;
    type IntoFuture = FlowFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        Flow::into_future(self)
    }
}

impl<T> fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match &self.repr {
            Repr::Imperative(flow) if flow.is_success() => "imperative(success)",
            Repr::Imperative(_) => "imperative(failure)",
            Repr::Delayed { .. } => "delayed",
        };
        f.debug_struct("Flow")
            .field("variant", &variant)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// 把新 Step 挂到尾部；挂载失败时得到失败流。
fn chain<U: Send + 'static>(tail: Arc<Step>, context: PropagatedContext, apply: Apply) -> Flow<U> {
    let step = Arc::new(Step::with_apply(apply));
    match tail.attach(Arc::clone(&step)) {
        Ok(()) => Flow::from_step(step, context),
        Err(error) => Flow::from(ImperativeFlow::with_context(Err(error), context)),
    }
}

/// 在上下文作用域内执行闭包；空上下文不触碰线程本地存储。
fn in_context<R>(context: &PropagatedContext, f: impl FnOnce() -> R) -> R {
    if context.is_empty() {
        return f();
    }
    let _scope = context.enter();
    f()
}

/// 以边界外的结果完成延迟流，失败先剥除完成包装。
fn settle<T: Send + 'static>(target: &DelayedFlow<T>, outcome: Result<Option<T>, FlowError>) {
    if let Err(error) = target.complete_with(outcome.map_err(FlowError::unwrap_completion)) {
        tracing::debug!(code = error.code(), "flow already settled: {}", error.message());
    }
}

/// Future 在产出前被丢弃时以取消失败完成目标流。
struct CancelGuard<T: Send + 'static> {
    target: Option<DelayedFlow<T>>,
}

impl<T: Send + 'static> Drop for CancelGuard<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let cancelled = FlowError::new(codes::CANCELLED, "future dropped before completion");
            settle(&target, Err(FlowError::completion(cancelled)));
        }
    }
}
