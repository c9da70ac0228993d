//! 与标准 `Future` 生态的桥接。
//!
//! - [`BoxFuture`]/[`BoxStream`] 直接复用 `futures` 的定义，避免同一概念出现两份别名；
//! - [`FlowFuture`] 把执行流暴露为标准 Future：已确定的流立即就绪，延迟流在完成线程上唤醒等待者。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

pub use futures::{future::BoxFuture, stream::BoxStream};

use crate::error::FlowError;

/// 执行流对应的标准 Future，输出与 [`crate::ImperativeFlow::into_result`] 一致。
///
/// # 契约说明（What）
/// - 多次轮询安全；完成后再次轮询返回 `flow.illegal_state` 失败；
/// - 丢弃 `FlowFuture` 不会取消执行流本身，仅丢弃结果。
pub struct FlowFuture<T> {
    state: State<T>,
}

enum State<T> {
    Ready(Option<Result<Option<T>, FlowError>>),
    Pending(Arc<Bridge<T>>),
}

/// 完成端与轮询端之间的交接点。
pub(crate) struct Bridge<T> {
    inner: spin::Mutex<BridgeState<T>>,
}

struct BridgeState<T> {
    outcome: Option<Result<Option<T>, FlowError>>,
    waker: Option<Waker>,
    consumed: bool,
}

impl<T> Bridge<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: spin::Mutex::new(BridgeState {
                outcome: None,
                waker: None,
                consumed: false,
            }),
        })
    }

    /// 写入结果并唤醒等待者；唤醒在锁外进行。
    pub(crate) fn resolve(&self, outcome: Result<Option<T>, FlowError>) {
        let waker = {
            let mut state = self.inner.lock();
            state.outcome = Some(outcome);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> FlowFuture<T> {
    pub(crate) fn ready(outcome: Result<Option<T>, FlowError>) -> Self {
        Self {
            state: State::Ready(Some(outcome)),
        }
    }

    pub(crate) fn pending(bridge: Arc<Bridge<T>>) -> Self {
        Self {
            state: State::Pending(bridge),
        }
    }
}

fn polled_after_completion() -> FlowError {
    FlowError::illegal_state("FlowFuture polled after completion")
}

// 未对任何字段做结构化固定，移动 `FlowFuture` 是安全的。
impl<T> Unpin for FlowFuture<T> {}

impl<T> Future for FlowFuture<T> {
    type Output = Result<Option<T>, FlowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or_else(|| Err(polled_after_completion())))
            }
            State::Pending(bridge) => {
                let mut state = bridge.inner.lock();
                if let Some(outcome) = state.outcome.take() {
                    state.consumed = true;
                    return Poll::Ready(outcome);
                }
                if state.consumed {
                    return Poll::Ready(Err(polled_after_completion()));
                }
                match &state.waker {
                    Some(existing) if existing.will_wake(cx.waker()) => {}
                    _ => state.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for FlowFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "consumed",
            State::Pending(_) => "pending",
        };
        f.debug_struct("FlowFuture").field("state", &state).finish()
    }
}
