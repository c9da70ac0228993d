//! 续体模型：挂起方法的“稍后送达结果”回调。
//!
//! # 设计背景（Why）
//! - 协程风格的挂起方法不直接返回结果，而是在参数列表末尾接收一个续体，完成时调用它；
//! - 分派器需要在调用链前后替换这个续体，并在恢复前把环境上下文合并进去。
//!   这里以显式的续体传递表达：续体是一次性对象，`resume_with` 消费自身，上下文是随续体携带的值。
//!
//! # 契约说明（What）
//! - `resume_with` 恰好调用一次（类型系统保证：它消费 `Box<Self>`）；
//! - `context` 是恢复时应当生效的传播上下文。

use std::fmt;

use spark_flow::{DelayedFlow, Flow, FlowError, PropagatedContext};

use crate::value::Value;

/// 挂起方法的续体。
pub trait Continuation: Send {
    /// 恢复时生效的传播上下文。
    fn context(&self) -> &PropagatedContext;

    /// 以结果恢复挂起的计算。
    fn resume_with(self: Box<Self>, result: Result<Option<Value>, FlowError>);
}

type Callback = Box<dyn FnOnce(Result<Option<Value>, FlowError>) + Send>;

/// 以闭包承载的续体，通常代表调用方。
pub struct CallbackContinuation {
    context: PropagatedContext,
    callback: Callback,
}

impl CallbackContinuation {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<Option<Value>, FlowError>) + Send + 'static,
    {
        Self {
            context: PropagatedContext::default(),
            callback: Box::new(callback),
        }
    }

    pub fn with_context(mut self, context: PropagatedContext) -> Self {
        self.context = context;
        self
    }
}

impl Continuation for CallbackContinuation {
    fn context(&self) -> &PropagatedContext {
        &self.context
    }

    fn resume_with(self: Box<Self>, result: Result<Option<Value>, FlowError>) {
        (self.callback)(result);
    }
}

impl fmt::Debug for CallbackContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContinuation")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// 以延迟执行流承载结果的续体。
///
/// 分派器在调用链之前用它替换调用方续体：被调用方恢复它时，结果写入执行流，
/// 分派器再从执行流把结果转交给原续体。
pub struct FlowContinuation {
    context: PropagatedContext,
    target: DelayedFlow<Value>,
}

impl FlowContinuation {
    /// 创建续体及其写端。
    pub fn create(context: PropagatedContext) -> (Self, DelayedFlow<Value>) {
        let target = DelayedFlow::create();
        (
            Self {
                context,
                target: target.clone(),
            },
            target,
        )
    }

    /// 创建续体及其读端。
    pub fn new(context: PropagatedContext) -> (Self, Flow<Value>) {
        let (continuation, target) = Self::create(context);
        (continuation, target.flow())
    }
}

impl Continuation for FlowContinuation {
    fn context(&self) -> &PropagatedContext {
        &self.context
    }

    fn resume_with(self: Box<Self>, result: Result<Option<Value>, FlowError>) {
        if let Err(error) = self.target.complete_with(result) {
            tracing::warn!(code = error.code(), "continuation resumed more than once");
        }
    }
}

impl fmt::Debug for FlowContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowContinuation")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// 合并额外上下文的委托续体。
///
/// 不修改被包装的续体：`context()` 返回合并后的上下文，恢复时先安装它，再委托给原续体。
pub struct ContextualContinuation {
    context: PropagatedContext,
    delegate: Box<dyn Continuation>,
}

impl ContextualContinuation {
    /// `extra` 中的条目遮蔽 `delegate` 原有的同名条目。
    pub fn new(delegate: Box<dyn Continuation>, extra: &PropagatedContext) -> Self {
        Self {
            context: delegate.context().merge(extra),
            delegate,
        }
    }
}

impl Continuation for ContextualContinuation {
    fn context(&self) -> &PropagatedContext {
        &self.context
    }

    fn resume_with(self: Box<Self>, result: Result<Option<Value>, FlowError>) {
        let Self { context, delegate } = *self;
        let _scope = context.enter();
        delegate.resume_with(result);
    }
}

impl fmt::Debug for ContextualContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextualContinuation")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
