//! 拦截方法的结果形态分派。
//!
//! # 设计背景（Why）
//! - 被拦截的方法可能返回普通值、Future、响应式流，或以续体形式挂起；
//!   拦截链本身不关心这些差异，只在链的两端需要“按声明形态调用、按声明形态交付”；
//! - 四种策略构成一个封闭集合，因此以枚举 [`InterceptedMethod`] 表达，
//!   在构造处与两个调用点（`intercept_result`、`handle_result`/`handle_exception`）穷尽匹配，
//!   新增形态时编译器会指出每一个遗漏点。
//!
//! # 逻辑解析（How）
//! - [`Dispatcher::classify`] 一次性选定策略，之后不再迁移：
//!   1. 挂起调用且末尾参数是续体 → 协程策略；挂起但无续体 → 同步策略；
//!   2. `void` → 同步；启用快速路径时 `String` → 同步；
//!   3. Future 形态 → Future 策略；
//!   4. Publisher 形态或转换服务登记的响应式类型 → Publisher 策略；
//!   5. 其他 → 同步。
//! - [`InterceptedMethod::dispatch`] 是常用的组合：推进拦截链，成功交给 `handle_result`，
//!   业务失败交给 `handle_exception`，致命错误直接返回。
//!
//! # 契约说明（What）
//! - 原始结果与交付结果都是 `Option<Value>`，`None` 表示空值；
//! - `InterceptError::Propagated` 只承载拦截链抛出的业务失败，其余变体都是不可重试的致命错误。
//!
//! # 设计取舍与风险（Trade-offs）
//! - 策略借用调用上下文（`&mut dyn InvocationContext`），生命周期不超过一次调用；
//!   需要异步交付的结果（Future、Publisher、续体恢复）自行持有所需的全部数据。

mod coroutine;
mod future;
mod publisher;
mod synchronous;

use std::{fmt, sync::Arc};

use spark_flow::{Executor, Flow, FlowError, PropagatedContext, ThreadExecutor};

pub use coroutine::CoroutineMethod;
pub use future::FutureMethod;
pub use publisher::PublisherMethod;
pub use synchronous::SynchronousMethod;

use crate::{
    config::DispatcherConfig,
    conversion::{ConversionService, DefaultConversionService},
    error::InterceptError,
    invocation::{Interceptor, InvocationContext},
    value::{Publisher, ReturnShape, ReturnType, Stage, Value},
};

/// 策略原生产出的结果形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultType {
    Synchronous,
    CompletionStage,
    Publisher,
}

/// 选定策略后的拦截方法。
pub enum InterceptedMethod<'a> {
    Synchronous(SynchronousMethod<'a>),
    Future(FutureMethod<'a>),
    Publisher(PublisherMethod<'a>),
    Coroutine(CoroutineMethod<'a>),
}

impl<'a> InterceptedMethod<'a> {
    /// 策略名称，用于日志。
    pub fn strategy_name(&self) -> &'static str {
        match self {
            Self::Synchronous(_) => "synchronous",
            Self::Future(_) => "future",
            Self::Publisher(_) => "publisher",
            Self::Coroutine(_) => "coroutine",
        }
    }

    pub fn result_type(&self) -> ResultType {
        match self {
            Self::Synchronous(_) => ResultType::Synchronous,
            Self::Future(_) | Self::Coroutine(_) => ResultType::CompletionStage,
            Self::Publisher(_) => ResultType::Publisher,
        }
    }

    /// 解包后的元素类型，例如 `Future<T>` 中的 `T`。
    pub fn return_type_value(&self) -> ReturnType {
        match self {
            Self::Synchronous(method) => method.return_type_value(),
            Self::Future(method) => method.return_type_value(),
            Self::Publisher(method) => method.return_type_value(),
            Self::Coroutine(method) => method.return_type_value(),
        }
    }

    /// 推进拦截链，返回策略原生形态的原始结果。
    pub fn intercept_result(&mut self) -> Result<Option<Value>, InterceptError> {
        self.intercept(None)
    }

    /// 从 `interceptor` 之后推进拦截链。
    pub fn intercept_result_from(
        &mut self,
        interceptor: &dyn Interceptor,
    ) -> Result<Option<Value>, InterceptError> {
        self.intercept(Some(interceptor))
    }

    fn intercept(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Option<Value>, InterceptError> {
        match self {
            Self::Synchronous(method) => method.intercept_result(from),
            Self::Future(method) => method.intercept_result(from),
            Self::Publisher(method) => method.intercept_result(from),
            Self::Coroutine(method) => method.intercept_result(from),
        }
    }

    /// 把原始结果规整为方法声明的确切类型。
    pub fn handle_result(&mut self, raw: Option<Value>) -> Result<Option<Value>, InterceptError> {
        match self {
            Self::Synchronous(method) => method.handle_result(raw),
            Self::Future(method) => method.handle_result(raw),
            Self::Publisher(method) => method.handle_result(raw),
            Self::Coroutine(method) => method.handle_result(raw),
        }
    }

    /// 以声明形态交付拦截链抛出的失败。
    pub fn handle_exception(&mut self, error: FlowError) -> Result<Option<Value>, InterceptError> {
        match self {
            Self::Synchronous(method) => method.handle_exception(error),
            Self::Future(method) => method.handle_exception(error),
            Self::Publisher(method) => method.handle_exception(error),
            Self::Coroutine(method) => method.handle_exception(error),
        }
    }

    /// 推进并交付：`intercept_result` 之后接 `handle_result` 或 `handle_exception`。
    pub fn dispatch(mut self) -> Result<Option<Value>, InterceptError> {
        match self.intercept_result() {
            Ok(raw) => self.handle_result(raw),
            Err(InterceptError::Propagated(error)) => self.handle_exception(error),
            Err(fatal) => Err(fatal),
        }
    }

    /// 以完成阶段形态推进；仅 Future 与协程策略可用。
    pub fn intercept_result_as_stage(&mut self) -> Result<Stage, InterceptError> {
        match self {
            Self::Future(method) => method.intercept_result_as_stage(),
            Self::Coroutine(method) => method.intercept_result_as_flow().map(Stage::from_flow),
            other => Err(other.unsupported("completion stage")),
        }
    }

    /// 以执行流形态推进；仅 Future 与协程策略可用。
    pub fn intercept_result_as_flow(&mut self) -> Result<Flow<Value>, InterceptError> {
        match self {
            Self::Future(method) => method.intercept_result_as_flow(),
            Self::Coroutine(method) => method.intercept_result_as_flow(),
            other => Err(other.unsupported("flow")),
        }
    }

    /// 以响应式流形态推进；仅 Publisher 策略可用。
    pub fn intercept_result_as_publisher(&mut self) -> Result<Publisher, InterceptError> {
        match self {
            Self::Publisher(method) => method.intercept_result_as_publisher(),
            other => Err(other.unsupported("publisher")),
        }
    }

    fn unsupported(&self, shape: &str) -> InterceptError {
        InterceptError::illegal_state(format!(
            "{} strategy cannot produce a {shape}",
            self.strategy_name()
        ))
    }
}

impl fmt::Debug for InterceptedMethod<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedMethod")
            .field("strategy", &self.strategy_name())
            .field("result_type", &self.result_type())
            .finish()
    }
}

/// 拦截方法分派器。
///
/// # 契约说明（What）
/// - 转换服务与执行器在构造时注入，不读取任何全局状态；
/// - `classify` 不推进拦截链，只检查返回类型、挂起标记与参数。
pub struct Dispatcher {
    config: DispatcherConfig,
    conversion: Arc<dyn ConversionService>,
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        conversion: Arc<dyn ConversionService>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            conversion,
            executor,
        }
    }

    /// 以默认转换服务与配置指定的执行器构建。
    pub fn from_config(config: DispatcherConfig) -> Result<Self, InterceptError> {
        let executor = config.build_executor()?;
        Ok(Self::new(
            config,
            Arc::new(DefaultConversionService::new()),
            executor,
        ))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn conversion(&self) -> &dyn ConversionService {
        self.conversion.as_ref()
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// 为一次调用选定策略。
    pub fn classify<'a>(&'a self, context: &'a mut dyn InvocationContext) -> InterceptedMethod<'a> {
        let continuation = context
            .arguments()
            .last()
            .filter(|argument| argument.is_continuation())
            .map(|_| context.arguments().len() - 1);
        let shape = context.return_type().shape();
        let method_name = context.method_name().to_owned();

        let method = if context.is_suspend() {
            match continuation {
                Some(index) => {
                    InterceptedMethod::Coroutine(CoroutineMethod::new(context, self, index))
                }
                None => InterceptedMethod::Synchronous(SynchronousMethod::new(context)),
            }
        } else {
            match shape {
                ReturnShape::Void => InterceptedMethod::Synchronous(SynchronousMethod::new(context)),
                ReturnShape::Text if self.config.string_fast_path => {
                    InterceptedMethod::Synchronous(SynchronousMethod::new(context))
                }
                ReturnShape::Future => InterceptedMethod::Future(FutureMethod::new(context, self)),
                ReturnShape::Publisher => {
                    InterceptedMethod::Publisher(PublisherMethod::new(context, self))
                }
                _ if self
                    .conversion
                    .is_publisher_convertible(context.return_type().type_id()) =>
                {
                    InterceptedMethod::Publisher(PublisherMethod::new(context, self))
                }
                _ => InterceptedMethod::Synchronous(SynchronousMethod::new(context)),
            }
        };

        tracing::debug!(
            method = %method_name,
            strategy = method.strategy_name(),
            "classified intercepted method"
        );
        method
    }

    /// 选定策略并完成一次分派。
    pub fn intercept(
        &self,
        context: &mut dyn InvocationContext,
    ) -> Result<Option<Value>, InterceptError> {
        self.classify(context).dispatch()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(
            DispatcherConfig::default(),
            Arc::new(DefaultConversionService::new()),
            Arc::new(ThreadExecutor::new("spark-intercept")),
        )
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// 推进到下一环，或从指定拦截器之后推进。
fn proceed(
    context: &mut dyn InvocationContext,
    from: Option<&dyn Interceptor>,
) -> Result<Option<Value>, FlowError> {
    match from {
        Some(interceptor) => context.proceed_from(interceptor),
        None => context.proceed(),
    }
}

/// 声明类型的泛型参数；未声明时为任意对象。
fn element_type(declared: &ReturnType) -> ReturnType {
    declared.argument().cloned().unwrap_or_else(ReturnType::object)
}

/// Publisher 策略在启用传播时附加的订阅前上下文。
fn ambient_context() -> Option<PropagatedContext> {
    let current = PropagatedContext::current();
    (!current.is_empty()).then_some(current)
}

#[cfg(test)]
mod tests {
    use spark_flow::InlineExecutor;

    use super::*;
    use crate::invocation::{Argument, MethodInvocation};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(DefaultConversionService::new()),
            Arc::new(InlineExecutor),
        )
    }

    #[test]
    #[tracing_test::traced_test]
    fn classification_is_logged_with_strategy_name() {
        let dispatcher = dispatcher();
        let mut invocation = MethodInvocation::builder("greet")
            .returns(ReturnType::of::<String>())
            .target(|_| Ok(Some(Box::new(String::from("hi")))))
            .build()
            .expect("构建应成功");

        let method = dispatcher.classify(&mut invocation);
        assert_eq!(method.strategy_name(), "synchronous");
        assert!(logs_contain("classified intercepted method"));
        assert!(logs_contain("greet"));
    }

    #[test]
    fn typed_accessor_on_wrong_strategy_is_illegal_state() {
        let dispatcher = dispatcher();
        let mut invocation = MethodInvocation::builder("count")
            .returns(ReturnType::of::<u32>())
            .argument(Argument::value(1_u32))
            .target(|_| Ok(Some(Box::new(1_u32))))
            .build()
            .expect("构建应成功");

        let mut method = dispatcher.classify(&mut invocation);
        let error = method
            .intercept_result_as_publisher()
            .expect_err("同步策略不能产出 Publisher");
        assert_eq!(error.code(), crate::codes::ILLEGAL_STATE);
    }
}
