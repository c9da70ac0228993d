//! 执行器抽象：引擎自身不持有线程池，并行执行一律委托给宿主提供的执行器。
//!
//! # 契约说明（What）
//! - [`Executor::execute`] 接收一次性任务，拒绝时返回 `flow.executor_rejected`；
//! - [`Executor::spawn`] 接收 `'static` Future，默认实现把它包装为一次阻塞驱动的任务，
//!   具备原生异步能力的执行器（如 Tokio）应覆写它；
//! - 执行器不得在 `execute` 内部吞掉任务：要么调度成功，要么返回错误。

use std::{
    borrow::Cow,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use crate::{
    error::{FlowError, codes},
    future::BoxFuture,
};

/// 一次性任务。
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// 宿主执行器契约。
///
/// # 设计背景（Why）
/// - `Flow::supply_async`、`Flow::from_future` 等工厂需要把工作交给“别的线程”，
///   但引擎不能假设具体运行时；
/// - 对象安全的 `execute` 配合带默认实现的 `spawn`，与 `spark-core` 中
///   `TaskExecutor::spawn_dyn`/`spawn` 的分层方式一致。
pub trait Executor: Send + Sync + 'static {
    /// 提交一次性任务。
    fn execute(&self, task: Runnable) -> Result<(), FlowError>;

    /// 提交 Future，默认在执行器线程上阻塞驱动至完成。
    fn spawn(&self, future: BoxFuture<'static, ()>) -> Result<(), FlowError> {
        self.execute(Box::new(move || futures::executor::block_on(future)))
    }
}

/// 在调用线程上立即执行任务。
///
/// 适用于测试与“本身已在工作线程上”的场景；`spawn` 会阻塞调用线程直至 Future 完成。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Runnable) -> Result<(), FlowError> {
        task();
        Ok(())
    }
}

/// 每个任务一个具名 OS 线程的执行器。
///
/// # 契约说明（What）
/// - 线程名形如 `<prefix>-<序号>`，便于在 `tracing` 输出中定位；
/// - 线程创建失败（资源耗尽）时返回 `flow.executor_rejected`，任务被丢弃且不会执行。
pub struct ThreadExecutor {
    prefix: Cow<'static, str>,
    counter: AtomicUsize,
    stack_size: Option<usize>,
}

impl ThreadExecutor {
    pub fn new(prefix: impl Into<Cow<'static, str>>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
            stack_size: None,
        }
    }

    /// 指定工作线程栈大小。
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("spark-flow")
    }
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("prefix", &self.prefix)
            .field("spawned", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Runnable) -> Result<(), FlowError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("{}-{index}", self.prefix));
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder
            .spawn(task)
            .map(|_detached| ())
            .map_err(|error| {
                tracing::warn!(prefix = %self.prefix, %error, "thread executor rejected task");
                FlowError::new(codes::EXECUTOR_REJECTED, "failed to spawn executor thread")
                    .with_cause(error)
            })
    }
}

#[cfg(feature = "runtime-tokio")]
pub use self::tokio_executor::TokioExecutor;

#[cfg(feature = "runtime-tokio")]
mod tokio_executor {
    use tokio::runtime::Handle;

    use super::{Executor, Runnable};
    use crate::{
        error::{FlowError, codes},
        future::BoxFuture,
    };

    /// 基于 Tokio 运行时句柄的执行器。
    ///
    /// - `execute` 走 `spawn_blocking`，避免阻塞型任务占用异步工作线程；
    /// - `spawn` 直接提交到运行时，Future 被取消时由 `Flow::from_future` 转换为 `flow.cancelled`。
    #[derive(Clone, Debug)]
    pub struct TokioExecutor {
        handle: Handle,
    }

    impl TokioExecutor {
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        /// 捕获当前所在的 Tokio 运行时；不在运行时内时返回 `flow.executor_rejected`。
        pub fn current() -> Result<Self, FlowError> {
            Handle::try_current().map(Self::new).map_err(|error| {
                FlowError::new(codes::EXECUTOR_REJECTED, "no tokio runtime is active")
                    .with_cause(error)
            })
        }
    }

    impl Executor for TokioExecutor {
        fn execute(&self, task: Runnable) -> Result<(), FlowError> {
            drop(self.handle.spawn_blocking(task));
            Ok(())
        }

        fn spawn(&self, future: BoxFuture<'static, ()>) -> Result<(), FlowError> {
            drop(self.handle.spawn(future));
            Ok(())
        }
    }
}
