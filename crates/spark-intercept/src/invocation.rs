//! 拦截调用链：分派器消费的协作方。
//!
//! # 设计背景（Why）
//! - 分派器只需要调用链的少数能力：读取方法名与返回类型、判断是否挂起、访问参数、
//!   推进到下一个拦截器（或从指定拦截器之后重新推进）。[`InvocationContext`] 只暴露这些；
//! - [`MethodInvocation`] 是一个有序拦截器列表加目标函数的具体实现，供宿主与测试直接使用。
//!
//! # 契约说明（What）
//! - `proceed` 返回链的原始结果：`Ok(None)` 表示链返回空值，`Err` 表示链抛出的业务失败；
//! - 链不得在 `proceed` 返回前持有对参数的借用；挂起方法如需保留续体，应从参数中取走它。

use std::{borrow::Cow, fmt, sync::Arc};

use spark_flow::FlowError;

use crate::{continuation::Continuation, error::InterceptError, value::{ReturnType, Value}};

/// 方法参数。
pub enum Argument {
    Value(Value),
    /// 挂起方法末尾的续体参数。
    Continuation(Box<dyn Continuation>),
    /// 已被取走的参数位置。
    Vacant,
}

impl Argument {
    pub fn value<T: std::any::Any + Send>(value: T) -> Self {
        Self::Value(Box::new(value))
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, Self::Continuation(_))
    }

    /// 取走参数，原位置留下 [`Argument::Vacant`]。
    pub fn take(&mut self) -> Argument {
        std::mem::replace(self, Argument::Vacant)
    }

    /// 取走续体；参数不是续体时保持原样并返回 `None`。
    pub fn take_continuation(&mut self) -> Option<Box<dyn Continuation>> {
        match self.take() {
            Argument::Continuation(continuation) => Some(continuation),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn as_value<T: std::any::Any>(&self) -> Option<&T> {
        match self {
            Self::Value(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Argument::Value(..)"),
            Self::Continuation(continuation) => f
                .debug_tuple("Argument::Continuation")
                .field(continuation.context())
                .finish(),
            Self::Vacant => f.write_str("Argument::Vacant"),
        }
    }
}

/// 调用链上下文。
pub trait InvocationContext: Send {
    fn method_name(&self) -> &str;

    fn return_type(&self) -> &ReturnType;

    /// 是否为协程风格的挂起调用。
    fn is_suspend(&self) -> bool;

    fn arguments(&self) -> &[Argument];

    fn arguments_mut(&mut self) -> &mut [Argument];

    /// 推进到链上的下一环。
    fn proceed(&mut self) -> Result<Option<Value>, FlowError>;

    /// 从 `interceptor` 之后重新推进。
    fn proceed_from(&mut self, interceptor: &dyn Interceptor) -> Result<Option<Value>, FlowError>;
}

/// 拦截器。
pub trait Interceptor: Send + Sync {
    /// 用于日志的名称。
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn intercept(&self, context: &mut dyn InvocationContext) -> Result<Option<Value>, FlowError>;
}

/// 链末端的目标方法。
pub type Target = Arc<dyn Fn(&mut [Argument]) -> Result<Option<Value>, FlowError> + Send + Sync>;

/// 有序拦截器列表加目标函数组成的调用链。
///
/// # 逻辑解析（How）
/// - `position` 指向下一个待执行的拦截器；越过末尾即调用目标函数；
/// - `proceed_from` 按指针身份定位拦截器，把 `position` 重置到它之后，
///   用于重试类拦截器重新执行链的剩余部分。
pub struct MethodInvocation {
    method_name: Cow<'static, str>,
    return_type: ReturnType,
    suspend: bool,
    arguments: Vec<Argument>,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    target: Target,
    position: usize,
}

impl MethodInvocation {
    pub fn builder(method_name: impl Into<Cow<'static, str>>) -> MethodInvocationBuilder {
        MethodInvocationBuilder {
            method_name: method_name.into(),
            return_type: ReturnType::void(),
            suspend: false,
            arguments: Vec::new(),
            interceptors: Vec::new(),
            target: None,
        }
    }

    /// 取回参数列表。
    pub fn into_arguments(self) -> Vec<Argument> {
        self.arguments
    }
}

impl InvocationContext for MethodInvocation {
    fn method_name(&self) -> &str {
        &self.method_name
    }

    fn return_type(&self) -> &ReturnType {
        &self.return_type
    }

    fn is_suspend(&self) -> bool {
        self.suspend
    }

    fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    fn arguments_mut(&mut self) -> &mut [Argument] {
        &mut self.arguments
    }

    fn proceed(&mut self) -> Result<Option<Value>, FlowError> {
        match self.interceptors.get(self.position).cloned() {
            Some(interceptor) => {
                self.position += 1;
                tracing::trace!(
                    method = %self.method_name,
                    interceptor = interceptor.name(),
                    "proceeding"
                );
                interceptor.intercept(self)
            }
            None => (self.target)(&mut self.arguments),
        }
    }

    fn proceed_from(&mut self, interceptor: &dyn Interceptor) -> Result<Option<Value>, FlowError> {
        let needle = std::ptr::from_ref(interceptor).cast::<()>();
        let index = self
            .interceptors
            .iter()
            .position(|candidate| Arc::as_ptr(candidate).cast::<()>() == needle)
            .ok_or_else(|| {
                InterceptError::illegal_state(format!(
                    "interceptor `{}` is not part of the chain for `{}`",
                    interceptor.name(),
                    self.method_name
                ))
            })?;
        self.position = index + 1;
        self.proceed()
    }
}

impl fmt::Debug for MethodInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInvocation")
            .field("method_name", &self.method_name)
            .field("return_type", &self.return_type)
            .field("suspend", &self.suspend)
            .field("arguments", &self.arguments)
            .field("interceptors", &self.interceptors.len())
            .field("position", &self.position)
            .finish()
    }
}

/// [`MethodInvocation`] 构建器。
pub struct MethodInvocationBuilder {
    method_name: Cow<'static, str>,
    return_type: ReturnType,
    suspend: bool,
    arguments: Vec<Argument>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    target: Option<Target>,
}

impl MethodInvocationBuilder {
    pub fn returns(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    pub fn suspend(mut self, suspend: bool) -> Self {
        self.suspend = suspend;
        self
    }

    pub fn argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn target<F>(mut self, target: F) -> Self
    where
        F: Fn(&mut [Argument]) -> Result<Option<Value>, FlowError> + Send + Sync + 'static,
    {
        self.target = Some(Arc::new(target));
        self
    }

    /// 完成构建；缺少目标函数时返回配置错误。
    pub fn build(self) -> Result<MethodInvocation, InterceptError> {
        let target = self.target.ok_or_else(|| {
            InterceptError::Config(format!("method `{}` has no target", self.method_name))
        })?;
        Ok(MethodInvocation {
            method_name: self.method_name,
            return_type: self.return_type,
            suspend: self.suspend,
            arguments: self.arguments,
            interceptors: self.interceptors.into(),
            target,
            position: 0,
        })
    }
}
