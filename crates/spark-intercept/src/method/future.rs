//! Future 策略。
//!
//! # 逻辑解析（How）
//! - 原生形态是 [`Stage`] 或 `Flow<Value>`；拦截链产出其他值时先尝试转换服务，
//!   仍不可用即说明拦截链与声明类型不匹配，报告 `IllegalState`；
//! - `handle_result` 依次尝试：直接赋值 → `Stage`/`Flow` 之间的显式转换 → 转换服务；
//! - 空值与失败都先落成一个已完成的阶段，再走 `handle_result`，保证交付形态一致。

use spark_flow::{Flow, FlowError};

use super::{Dispatcher, element_type, proceed};
use crate::{
    error::InterceptError,
    invocation::{Interceptor, InvocationContext},
    value::{ReturnType, Stage, Value},
};

/// Future 策略。
pub struct FutureMethod<'a> {
    context: &'a mut dyn InvocationContext,
    dispatcher: &'a Dispatcher,
}

impl<'a> FutureMethod<'a> {
    pub(super) fn new(context: &'a mut dyn InvocationContext, dispatcher: &'a Dispatcher) -> Self {
        Self {
            context,
            dispatcher,
        }
    }

    pub fn return_type_value(&self) -> ReturnType {
        element_type(self.context.return_type())
    }

    /// 原始结果保证是 `Stage` 或 `Flow<Value>`。
    pub fn intercept_result(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Option<Value>, InterceptError> {
        let raw = proceed(&mut *self.context, from)?;
        let Some(value) = raw else {
            return Err(InterceptError::illegal_state(format!(
                "`{}` returned no value but a completion stage was required",
                self.context.method_name()
            )));
        };
        if value.is::<Stage>() || value.is::<Flow<Value>>() {
            return Ok(Some(value));
        }
        match self
            .dispatcher
            .conversion()
            .convert(value, &ReturnType::of::<Stage>())
        {
            Ok(stage) => Ok(Some(stage)),
            Err(_) => Err(InterceptError::illegal_state(format!(
                "cannot convert result of `{}` to a completion stage",
                self.context.method_name()
            ))),
        }
    }

    pub fn intercept_result_as_stage(&mut self) -> Result<Stage, InterceptError> {
        let value = self.intercept_native()?;
        into_stage(value).map_err(|_| self.not_a_stage())
    }

    pub fn intercept_result_as_flow(&mut self) -> Result<Flow<Value>, InterceptError> {
        let value = self.intercept_native()?;
        into_flow(value, self.dispatcher).map_err(|_| self.not_a_stage())
    }

    fn intercept_native(&mut self) -> Result<Value, InterceptError> {
        self.intercept_result(None)?
            .ok_or_else(|| self.not_a_stage())
    }

    fn not_a_stage(&self) -> InterceptError {
        InterceptError::illegal_state(format!(
            "`{}` did not produce a completion stage",
            self.context.method_name()
        ))
    }

    /// 把原始结果规整为声明的 Future 类型；空值视为“已完成且无值”。
    pub fn handle_result(&mut self, raw: Option<Value>) -> Result<Option<Value>, InterceptError> {
        let Some(value) = raw else {
            return self.completed(Ok(None));
        };
        let declared = self.context.return_type();
        if declared.accepts(&value) {
            return Ok(Some(value));
        }
        let value = if declared.is::<Stage>() {
            match into_stage(value) {
                Ok(stage) => return Ok(Some(Box::new(stage))),
                Err(value) => value,
            }
        } else if declared.is::<Flow<Value>>() {
            match into_flow(value, self.dispatcher) {
                Ok(flow) => return Ok(Some(Box::new(flow))),
                Err(value) => value,
            }
        } else {
            value
        };
        match self.dispatcher.conversion().convert(value, declared) {
            Ok(converted) => Ok(Some(converted)),
            Err(_) => {
                tracing::error!(
                    method = self.context.method_name(),
                    return_type = %declared,
                    "no conversion to the declared future type"
                );
                Err(InterceptError::Conversion {
                    method: self.context.method_name().to_owned(),
                    target: declared.name(),
                })
            }
        }
    }

    /// 以失败的阶段交付。
    pub fn handle_exception(&mut self, error: FlowError) -> Result<Option<Value>, InterceptError> {
        self.completed(Err(error))
    }

    fn completed(
        &mut self,
        outcome: Result<Option<Value>, FlowError>,
    ) -> Result<Option<Value>, InterceptError> {
        if self.context.return_type().is::<Flow<Value>>() {
            return Ok(Some(Box::new(Flow::<Value>::from_result(outcome))));
        }
        self.handle_result(Some(Box::new(Stage::ready(outcome))))
    }
}

fn into_stage(value: Value) -> Result<Stage, Value> {
    let value = match value.downcast::<Stage>() {
        Ok(stage) => return Ok(*stage),
        Err(value) => value,
    };
    value
        .downcast::<Flow<Value>>()
        .map(|flow| Stage::from_flow(*flow))
}

fn into_flow(value: Value, dispatcher: &Dispatcher) -> Result<Flow<Value>, Value> {
    let value = match value.downcast::<Flow<Value>>() {
        Ok(flow) => return Ok(*flow),
        Err(value) => value,
    };
    value
        .downcast::<Stage>()
        .map(|stage| stage.into_flow(dispatcher.executor()))
}
