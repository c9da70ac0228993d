mod step;

use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{context::PropagatedContext, error::FlowError, flow::Flow};

pub(crate) use step::{Apply, Delivery, Readiness, Step, Transition, erase, restore, restore_cloned};

/// 稍后才会被完成的执行流。
///
/// # 设计背景（Why）
/// - 回调式 API、跨线程完成信号、响应式订阅等场景下，值在构造时并不存在；
///   `DelayedFlow` 是“写端”，[`DelayedFlow::flow`] 取得的 [`Flow`] 是“读端”；
/// - 写端可克隆并跨线程移动，任一线程都可以完成它，但只有第一次完成生效。
///
/// # 契约说明（What）
/// - `complete*` 系列方法在重复调用时返回 `flow.already_completed`，不会覆盖先前的结果；
/// - 已注册的后续变换会在完成线程上同步执行；尚未注册时结果被暂存，
///   直到后续链式调用在注册线程上取走它；
/// - `flow()` 每次返回共享同一链头的读端；只有第一个被链式使用的读端能接到结果，
///   其余读端的链式调用得到 `flow.already_attached` 失败；
/// - 探测（`try_complete*`）不算读端：完成后可以任意次探测，结果仍留给后续链式调用。
pub struct DelayedFlow<T> {
    head: Arc<Step>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> DelayedFlow<T> {
    /// 创建尚未完成的延迟流。
    pub fn create() -> Self {
        Self {
            head: Arc::new(Step::pending()),
            _marker: PhantomData,
        }
    }

    /// 以值完成。
    pub fn complete(&self, value: T) -> Result<(), FlowError> {
        self.complete_with(Ok(Some(value)))
    }

    /// 以“成功但无值”完成。
    pub fn complete_empty(&self) -> Result<(), FlowError> {
        self.complete_with(Ok(None))
    }

    /// 以失败完成。
    pub fn complete_exceptionally(&self, error: FlowError) -> Result<(), FlowError> {
        self.complete_with(Err(error))
    }

    /// 以任意结果完成。
    pub fn complete_with(&self, outcome: Result<Option<T>, FlowError>) -> Result<(), FlowError> {
        self.head.try_complete(Delivery::bare(erase(outcome)))
    }

    /// 取得读端。
    pub fn flow(&self) -> Flow<T> {
        Flow::from_step(Arc::clone(&self.head), PropagatedContext::default())
    }
}

impl<T> Clone for DelayedFlow<T> {
    fn clone(&self) -> Self {
        Self {
            head: Arc::clone(&self.head),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for DelayedFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedFlow")
            .field("type", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}
