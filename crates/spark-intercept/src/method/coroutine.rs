//! 协程策略。
//!
//! # 设计背景（Why）
//! - 挂起方法通过末尾的续体交付结果，返回值只是“已挂起”哨兵或内联完成的值；
//! - 拦截链希望以执行流观察结果，因此在推进前把调用方续体替换为 [`FlowContinuation`]，
//!   推进后放回原续体，再在执行流完成时恢复它。
//!
//! # 逻辑解析（How）
//! 1. `intercept_result`：取出原续体 → 以其上下文创建 `FlowContinuation` 填入参数位 → 推进 →
//!    放回原续体；若结果不是 [`Suspended`]，说明方法内联完成，立即以该结果完成执行流；
//! 2. `handle_result`：从参数位取走原续体，在执行流完成时恢复它；返回 `Suspended`；
//! 3. `update_coroutine_context`：以 [`ContextualContinuation`] 包装原续体，不修改它本身。
//!
//! # 契约说明（What）
//! - 原续体恰好恢复一次；空值在 void 方法上替换为 `()`，在可空方法上保持为空，
//!   其余情况以 `intercept.null_result` 失败恢复；
//! - 挂起方法若保留替换后的续体，须从参数中取走它；参数位在推进结束后总会被原续体覆盖。

use spark_flow::{DelayedFlow, Flow, FlowError, PropagatedContext};

use super::{Dispatcher, proceed};
use crate::{
    continuation::{ContextualContinuation, Continuation, FlowContinuation},
    error::InterceptError,
    invocation::{Argument, Interceptor, InvocationContext},
    value::{ReturnType, Stage, Suspended, Value},
};

/// 协程策略。
pub struct CoroutineMethod<'a> {
    context: &'a mut dyn InvocationContext,
    dispatcher: &'a Dispatcher,
    continuation: usize,
}

impl<'a> CoroutineMethod<'a> {
    pub(super) fn new(
        context: &'a mut dyn InvocationContext,
        dispatcher: &'a Dispatcher,
        continuation: usize,
    ) -> Self {
        Self {
            context,
            dispatcher,
            continuation,
        }
    }

    /// 挂起返回类型；`()` 规整为 void。
    pub fn return_type_value(&self) -> ReturnType {
        let declared = self.context.return_type();
        if declared.is::<()>() {
            ReturnType::void()
        } else {
            declared.clone()
        }
    }

    /// 原续体携带的上下文。
    pub fn coroutine_context(&self) -> Option<&PropagatedContext> {
        match self.context.arguments().get(self.continuation) {
            Some(Argument::Continuation(continuation)) => Some(continuation.context()),
            _ => None,
        }
    }

    /// 把 `extra` 合并进续体上下文；同名条目以 `extra` 为准。
    pub fn update_coroutine_context(
        &mut self,
        extra: &PropagatedContext,
    ) -> Result<(), InterceptError> {
        let original = self.take_continuation()?;
        self.put_continuation(Box::new(ContextualContinuation::new(original, extra)));
        Ok(())
    }

    pub fn intercept_result(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Option<Value>, InterceptError> {
        let flow = self.intercept_flow(from)?;
        Ok(Some(Box::new(flow)))
    }

    pub fn intercept_result_as_flow(&mut self) -> Result<Flow<Value>, InterceptError> {
        self.intercept_flow(None)
    }

    fn intercept_flow(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Flow<Value>, InterceptError> {
        let original = self.take_continuation()?;
        let (replacement, target) = FlowContinuation::create(original.context().clone());
        self.put_continuation(Box::new(replacement));

        let result = proceed(&mut *self.context, from);
        self.put_continuation(original);

        match result {
            Ok(Some(value)) if Suspended::is_suspended(&value) => {}
            Ok(inline) => settle_inline(&target, Ok(inline)),
            Err(error) => return Err(InterceptError::Propagated(error)),
        }
        Ok(target.flow())
    }

    /// 在结果完成时恢复原续体；返回 `Suspended`。
    pub fn handle_result(&mut self, raw: Option<Value>) -> Result<Option<Value>, InterceptError> {
        let flow = match raw {
            None => Flow::empty(),
            Some(value) => self.to_flow(value)?,
        };
        let continuation = self.take_continuation()?;
        let declared = self.context.return_type();
        let substitute = Substitute {
            method: self.context.method_name().to_owned(),
            void: declared.is_void(),
            nullable: declared.is_nullable(),
            target: declared.name(),
        };
        flow.on_complete(move |value, error| {
            let result = match error {
                Some(error) => Err(error),
                None => substitute.apply(value),
            };
            continuation.resume_with(result);
        });
        Ok(Some(Box::new(Suspended)))
    }

    /// 以失败恢复原续体；返回 `Suspended`。
    pub fn handle_exception(&mut self, error: FlowError) -> Result<Option<Value>, InterceptError> {
        let continuation = self.take_continuation()?;
        continuation.resume_with(Err(error));
        Ok(Some(Box::new(Suspended)))
    }

    fn to_flow(&self, value: Value) -> Result<Flow<Value>, InterceptError> {
        let value = match value.downcast::<Flow<Value>>() {
            Ok(flow) => return Ok(*flow),
            Err(value) => value,
        };
        match value.downcast::<Stage>() {
            Ok(stage) => Ok(stage.into_flow(self.dispatcher.executor())),
            Err(_) => Err(InterceptError::illegal_state(format!(
                "cannot convert result of `{}` to a completion stage",
                self.context.method_name()
            ))),
        }
    }

    fn take_continuation(&mut self) -> Result<Box<dyn Continuation>, InterceptError> {
        self.context
            .arguments_mut()
            .get_mut(self.continuation)
            .and_then(Argument::take_continuation)
            .ok_or_else(|| {
                InterceptError::illegal_state(format!(
                    "continuation of `{}` was already consumed",
                    self.context.method_name()
                ))
            })
    }

    fn put_continuation(&mut self, continuation: Box<dyn Continuation>) {
        if let Some(slot) = self.context.arguments_mut().get_mut(self.continuation) {
            *slot = Argument::Continuation(continuation);
        }
    }
}

/// 内联完成时直接写入结果。
fn settle_inline(target: &DelayedFlow<Value>, outcome: Result<Option<Value>, FlowError>) {
    if let Err(error) = target.complete_with(outcome) {
        tracing::warn!(
            code = error.code(),
            "suspend method completed inline after resuming its continuation"
        );
    }
}

/// 空值替换规则。
struct Substitute {
    method: String,
    void: bool,
    nullable: bool,
    target: &'static str,
}

impl Substitute {
    fn apply(self, value: Option<Value>) -> Result<Option<Value>, FlowError> {
        match value {
            Some(value) => Ok(Some(value)),
            None if self.void => Ok(Some(Box::new(()))),
            None if self.nullable => Ok(None),
            None => {
                tracing::error!(
                    method = %self.method,
                    return_type = self.target,
                    "suspend method produced no value"
                );
                Err(InterceptError::NullResult {
                    method: self.method,
                    target: self.target,
                }
                .into())
            }
        }
    }
}
