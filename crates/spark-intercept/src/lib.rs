#![deny(unsafe_code)]
#![doc = "spark-intercept: 拦截调用的结果形态分派器。"]
#![doc = ""]
#![doc = "== 工作流程 =="]
#![doc = "1. `Dispatcher::classify` 依据调用的返回类型与挂起标记选出一种策略（同步、Future、Publisher、协程）；"]
#![doc = "2. 策略驱动拦截链，得到原生形态的原始结果；"]
#![doc = "3. `handle_result`/`handle_exception` 把结果或失败还原为方法签名声明的确切形态。"]
#![doc = ""]
#![doc = "== 依赖关系 =="]
#![doc = "异步结果统一以 `spark_flow::Flow` 表示；类型转换服务与执行器由构造方显式注入，不存在全局单例。"]

pub mod config;
pub mod continuation;
pub mod conversion;
pub mod error;
pub mod invocation;
pub mod method;
pub mod value;

pub use config::{DispatcherConfig, ExecutorKind};
pub use continuation::{
    CallbackContinuation, Continuation, ContextualContinuation, FlowContinuation,
};
pub use conversion::{ConversionService, DefaultConversionService};
pub use error::{InterceptError, codes};
pub use invocation::{
    Argument, Interceptor, InvocationContext, MethodInvocation, MethodInvocationBuilder, Target,
};
pub use method::{
    CoroutineMethod, Dispatcher, FutureMethod, InterceptedMethod, PublisherMethod, ResultType,
    SynchronousMethod,
};
pub use value::{Publisher, ReturnShape, ReturnType, Single, Stage, Suspended, Value};
