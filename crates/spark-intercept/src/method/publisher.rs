//! Publisher 策略。
//!
//! # 逻辑解析（How）
//! - 原生形态是 [`Publisher`]：空值视为空流，其他响应式类型经转换服务转为 `Publisher`；
//! - `handle_result` 把原生流转换为声明的响应式类型（例如 [`crate::Single`]）；
//! - 启用上下文传播时，拦截当下的线程环境上下文被附加到流上，
//!   之后无论流在哪个线程上被轮询，管道内代码都能读到它。

use spark_flow::{FlowError, PropagatedContext};

use super::{Dispatcher, ambient_context, element_type, proceed};
use crate::{
    error::InterceptError,
    invocation::{Interceptor, InvocationContext},
    value::{Publisher, ReturnType, Single, Value},
};

/// Publisher 策略。
pub struct PublisherMethod<'a> {
    context: &'a mut dyn InvocationContext,
    dispatcher: &'a Dispatcher,
}

impl<'a> PublisherMethod<'a> {
    pub(super) fn new(context: &'a mut dyn InvocationContext, dispatcher: &'a Dispatcher) -> Self {
        Self {
            context,
            dispatcher,
        }
    }

    pub fn return_type_value(&self) -> ReturnType {
        element_type(self.context.return_type())
    }

    /// 是否为携带传播上下文的变体。
    pub fn propagates_context(&self) -> bool {
        self.dispatcher.config().context_propagation
    }

    pub fn intercept_result(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Option<Value>, InterceptError> {
        let publisher = self.intercept_publisher(from)?;
        Ok(Some(Box::new(publisher)))
    }

    pub fn intercept_result_as_publisher(&mut self) -> Result<Publisher, InterceptError> {
        self.intercept_publisher(None)
    }

    fn intercept_publisher(
        &mut self,
        from: Option<&dyn Interceptor>,
    ) -> Result<Publisher, InterceptError> {
        let publisher = match proceed(&mut *self.context, from)? {
            None => Publisher::empty(),
            Some(value) => self.to_publisher(value)?,
        };
        Ok(self.attach_context(publisher))
    }

    fn to_publisher(&self, value: Value) -> Result<Publisher, InterceptError> {
        let value = match value.downcast::<Publisher>() {
            Ok(publisher) => return Ok(*publisher),
            Err(value) => value,
        };
        self.dispatcher
            .conversion()
            .convert(value, &ReturnType::of::<Publisher>())
            .ok()
            .and_then(|converted| converted.downcast::<Publisher>().ok())
            .map(|publisher| *publisher)
            .ok_or_else(|| {
                InterceptError::illegal_state(format!(
                    "cannot convert result of `{}` to a publisher",
                    self.context.method_name()
                ))
            })
    }

    fn attach_context(&self, publisher: Publisher) -> Publisher {
        if publisher.context().is_some() {
            return publisher;
        }
        match self.context_to_attach() {
            Some(context) => publisher.with_context(context),
            None => publisher,
        }
    }

    /// 启用传播且环境上下文非空时返回它。
    fn context_to_attach(&self) -> Option<PropagatedContext> {
        if !self.propagates_context() {
            return None;
        }
        ambient_context()
    }

    /// 把原始结果转换为声明的响应式类型；空值视为空流。
    pub fn handle_result(&mut self, raw: Option<Value>) -> Result<Option<Value>, InterceptError> {
        let value: Value = match raw {
            Some(value) => value,
            None => Box::new(self.attach_context(Publisher::empty())),
        };
        let declared = self.context.return_type();
        if declared.accepts(&value) {
            return Ok(Some(value));
        }
        match self.dispatcher.conversion().convert(value, declared) {
            Ok(converted) => Ok(Some(converted)),
            Err(_) => {
                tracing::error!(
                    method = self.context.method_name(),
                    return_type = %declared,
                    "no conversion to the declared publisher type"
                );
                Err(InterceptError::Conversion {
                    method: self.context.method_name().to_owned(),
                    target: declared.name(),
                })
            }
        }
    }

    /// 以只发出一个失败事件的流交付。
    pub fn handle_exception(&mut self, error: FlowError) -> Result<Option<Value>, InterceptError> {
        if self.context.return_type().is::<Single>() {
            let single = Single::error(error);
            let single = match self.context_to_attach() {
                Some(context) => single.with_context(context),
                None => single,
            };
            return Ok(Some(Box::new(single)));
        }
        let publisher = self.attach_context(Publisher::error(error));
        self.handle_result(Some(Box::new(publisher)))
    }
}
