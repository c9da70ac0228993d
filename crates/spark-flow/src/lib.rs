#![deny(unsafe_code)]
#![doc = "spark-flow: 无锁、分配友好的延迟执行流引擎。"]
#![doc = ""]
#![doc = "== 模型概览 =="]
#![doc = "`Flow<T>` 表示一个“可能已知、可能稍后才知道”的值：成功（可能为空值）或失败（`FlowError`）。"]
#![doc = "1. 即时变体 (`ImperativeFlow`)：值或错误在构造时已确定，所有算子立即执行并返回新实例。"]
#![doc = "2. 延迟变体 (`DelayedFlow`)：由单向链接的 Step 链承载，完成信号可来自任意线程。"]
#![doc = ""]
#![doc = "== 失败语义 =="]
#![doc = "用户闭包的失败（返回 `Err` 或 panic）一律被捕获为流的失败状态，绝不会从算子调用处抛出。"]

pub mod context;
mod delayed;
pub mod error;
pub mod executor;
mod flow;
pub mod future;
mod imperative;
mod sync;

pub use context::{ContextScope, PropagatedContext};
pub use delayed::DelayedFlow;
pub use error::{ErrorCause, FlowError, codes};
pub use executor::{Executor, InlineExecutor, Runnable, ThreadExecutor};
#[cfg(feature = "runtime-tokio")]
pub use executor::TokioExecutor;
pub use flow::Flow;
pub use future::{BoxFuture, BoxStream, FlowFuture};
pub use imperative::ImperativeFlow;
