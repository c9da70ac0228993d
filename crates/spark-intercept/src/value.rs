//! 拦截层的值模型：类型擦除的结果值、返回类型描述符，以及调用方可见的原生形态。
//!
//! # 设计背景（Why）
//! - 拦截链是异构的：同一条链要服务返回普通值、Future、响应式流与挂起函数的方法，
//!   因此链上传递的结果统一擦除为 [`Value`]，再由策略依据 [`ReturnType`] 还原；
//! - [`Stage`]、[`Publisher`]、[`Single`]、[`Suspended`] 是分派器能够识别与产出的原生形态。
//!
//! # 契约说明（What）
//! - 原始结果为 `Option<Value>`：`None` 即“链返回了空值”；
//! - `Publisher`/`Single` 可携带传播上下文，每次轮询都会把它安装为线程环境上下文。

use std::{
    any::{Any, TypeId},
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt, stream};
use spark_flow::{BoxFuture, BoxStream, Executor, Flow, FlowError, PropagatedContext};

/// 类型擦除后的结果值。
pub type Value = Box<dyn Any + Send>;

/// 读取擦除值的真实类型标识。
pub(crate) fn type_of(value: &Value) -> TypeId {
    (**value).type_id()
}

/// 返回类型的形态分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// 无返回值。
    Void,
    /// 文本（`String`），可走同步快速路径。
    Text,
    /// Future/完成阶段。
    Future,
    /// 响应式流。
    Publisher,
    /// 其他普通值。
    Value,
}

/// 方法声明的返回类型。
///
/// # 契约说明（What）
/// - `type_id` 用于与擦除值比对“是否可直接赋值”；
/// - `argument` 是泛型参数（如 `Future<T>` 中的 `T`），决定策略的 `return_type_value`；
/// - `nullable` 仅影响挂起方法在产出空值时的处理。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnType {
    name: &'static str,
    type_id: TypeId,
    shape: ReturnShape,
    argument: Option<Box<ReturnType>>,
    nullable: bool,
}

impl ReturnType {
    /// `()` 返回类型。
    pub fn void() -> Self {
        Self::with_shape::<()>(ReturnShape::Void, None)
    }

    /// 由具体类型推断形态。
    pub fn of<T: Any>() -> Self {
        let id = TypeId::of::<T>();
        let shape = if id == TypeId::of::<()>() {
            ReturnShape::Void
        } else if id == TypeId::of::<String>() {
            ReturnShape::Text
        } else if id == TypeId::of::<Stage>() || id == TypeId::of::<Flow<Value>>() {
            ReturnShape::Future
        } else if id == TypeId::of::<Publisher>() || id == TypeId::of::<Single>() {
            ReturnShape::Publisher
        } else {
            ReturnShape::Value
        };
        Self::with_shape::<T>(shape, None)
    }

    /// 未声明泛型参数时使用的“任意对象”类型。
    pub fn object() -> Self {
        Self {
            name: "object",
            ..Self::with_shape::<Value>(ReturnShape::Value, None)
        }
    }

    /// Future 形态的返回类型 `F<argument>`。
    pub fn future<F: Any>(argument: ReturnType) -> Self {
        Self::with_shape::<F>(ReturnShape::Future, Some(argument))
    }

    /// 响应式流形态的返回类型 `P<argument>`。
    pub fn publisher<P: Any>(argument: ReturnType) -> Self {
        Self::with_shape::<P>(ReturnShape::Publisher, Some(argument))
    }

    /// `Stage<argument>`。
    pub fn stage(argument: ReturnType) -> Self {
        Self::future::<Stage>(argument)
    }

    /// `Flow<argument>`。
    pub fn flow(argument: ReturnType) -> Self {
        Self::future::<Flow<Value>>(argument)
    }

    /// 标记为可空。
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn with_shape<T: Any>(shape: ReturnShape, argument: Option<ReturnType>) -> Self {
        Self {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            shape,
            argument: argument.map(Box::new),
            nullable: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn shape(&self) -> ReturnShape {
        self.shape
    }

    /// 首个泛型参数。
    pub fn argument(&self) -> Option<&ReturnType> {
        self.argument.as_deref()
    }

    pub fn is_void(&self) -> bool {
        self.shape == ReturnShape::Void
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// 擦除值能否直接赋值给该类型。
    pub fn accepts(&self, value: &Value) -> bool {
        type_of(value) == self.type_id
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.argument {
            Some(argument) => write!(f, "{}<{}>", self.name, argument),
            None => f.write_str(self.name),
        }
    }
}

/// 完成阶段：产出三态结果的 `Send` Future。
pub struct Stage {
    inner: BoxFuture<'static, Result<Option<Value>, FlowError>>,
}

impl Stage {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Option<Value>, FlowError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// 已完成的阶段。
    pub fn ready(outcome: Result<Option<Value>, FlowError>) -> Self {
        Self::new(futures::future::ready(outcome))
    }

    /// 由执行流桥接；流完成时阶段就绪。
    pub fn from_flow(flow: Flow<Value>) -> Self {
        Self::new(flow.into_future())
    }

    /// 在执行器上驱动阶段，转换为推送式执行流。
    pub fn into_flow(self, executor: &dyn Executor) -> Flow<Value> {
        Flow::from_future_outcome(executor, self)
    }
}

impl Future for Stage {
    type Output = Result<Option<Value>, FlowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").finish_non_exhaustive()
    }
}

/// 0..N 元素的响应式流。
///
/// # 契约说明（What）
/// - 元素与失败都经由 `Result` 传递；失败元素之后的行为由底层流决定，
///   分派器构造的失败流只发出一个失败事件；
/// - 携带上下文时，每次 `poll_next` 期间该上下文是线程环境上下文，
///   因此即使在其他线程上被轮询，管道内代码也能读到订阅前建立的上下文。
pub struct Publisher {
    stream: BoxStream<'static, Result<Value, FlowError>>,
    context: Option<PropagatedContext>,
}

impl Publisher {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, FlowError>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
            context: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// 只发出一个失败事件的流。
    pub fn error(error: FlowError) -> Self {
        Self::new(stream::iter(std::iter::once(Err(error))))
    }

    pub fn just(value: Value) -> Self {
        Self::new(stream::iter(std::iter::once(Ok(value))))
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(stream::iter(values.into_iter().map(Ok)))
    }

    /// 附带传播上下文。
    pub fn with_context(mut self, context: PropagatedContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn context(&self) -> Option<&PropagatedContext> {
        self.context.as_ref()
    }
}

impl Stream for Publisher {
    type Item = Result<Value, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _scope = this.context.as_ref().map(PropagatedContext::enter);
        this.stream.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// 0..1 元素的响应式流。
pub struct Single {
    stage: Option<Stage>,
    context: Option<PropagatedContext>,
}

impl Single {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            context: None,
        }
    }

    pub fn just(value: Value) -> Self {
        Self::new(Stage::ready(Ok(Some(value))))
    }

    pub fn empty() -> Self {
        Self::new(Stage::ready(Ok(None)))
    }

    pub fn error(error: FlowError) -> Self {
        Self::new(Stage::ready(Err(error)))
    }

    pub fn with_context(mut self, context: PropagatedContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn context(&self) -> Option<&PropagatedContext> {
        self.context.as_ref()
    }
}

impl Stream for Single {
    type Item = Result<Value, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stage) = this.stage.as_mut() else {
            return Poll::Ready(None);
        };
        let _scope = this.context.as_ref().map(PropagatedContext::enter);
        match Pin::new(stage).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                this.stage = None;
                Poll::Ready(outcome.transpose())
            }
        }
    }
}

impl fmt::Debug for Single {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Single")
            .field("done", &self.stage.is_none())
            .field("context", &self.context)
            .finish()
    }
}

impl From<Single> for Publisher {
    fn from(mut single: Single) -> Self {
        let context = single.context.take();
        Publisher {
            context,
            ..Publisher::new(single)
        }
    }
}

impl From<Publisher> for Single {
    fn from(mut publisher: Publisher) -> Self {
        let context = publisher.context.take();
        let first = Stage::new(async move { publisher.next().await.transpose() });
        Single {
            context,
            ..Single::new(first)
        }
    }
}

/// 协程挂起哨兵：挂起方法返回它表示“结果稍后经由续体送达”。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Suspended;

impl Suspended {
    pub fn is_suspended(value: &Value) -> bool {
        value.is::<Suspended>()
    }
}
