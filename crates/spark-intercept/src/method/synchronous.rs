use spark_flow::FlowError;

use super::proceed;
use crate::{
    error::InterceptError,
    invocation::{Interceptor, InvocationContext},
    value::{ReturnType, Value},
};

/// 同步策略：直接返回拦截链的结果，失败原样抛回。
pub struct SynchronousMethod<'a> {
    context: &'a mut dyn InvocationContext,
}

impl<'a> SynchronousMethod<'a> {
    pub(super) fn new(context: &'a mut dyn InvocationContext) -> Self {
        Self { context }
    }

    pub fn return_type_value(&self) -> ReturnType {
        self.context.return_type().clone()
    }

    pub fn intercept_result(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Option<Value>, InterceptError> {
        Ok(proceed(&mut *self.context, from)?)
    }

    pub fn handle_result(&mut self, raw: Option<Value>) -> Result<Option<Value>, InterceptError> {
        Ok(raw)
    }

    pub fn handle_exception(&mut self, error: FlowError) -> Result<Option<Value>, InterceptError> {
        Err(InterceptError::Propagated(error))
    }
}
