use std::fmt;

use crate::{
    context::PropagatedContext,
    error::{FlowError, catch_user_fault},
    flow::Flow,
};

/// 结果已确定的执行流快照。
///
/// # 设计背景（Why）
/// - 值或错误在构造时即已知，所有变换都可以立即执行，无需 Step 链与原子状态；
/// - 采用不可变值语义：每个算子消费接收者并返回新实例，调用方只能继续使用返回值，
///   不存在“变换后误用旧引用”的别名问题。
///
/// # 契约说明（What）
/// - `outcome` 为 `Ok(Some(v))`（有值）、`Ok(None)`（成功但无值）或 `Err(e)`（失败）；
/// - `map`/`try_map` 在失败时不调用闭包，原失败原样保留；
/// - 闭包 panic 或返回 `Err` 时得到失败快照，绝不向调用方抛出。
#[derive(Clone)]
pub struct ImperativeFlow<T> {
    outcome: Result<Option<T>, FlowError>,
    context: PropagatedContext,
}

impl<T> ImperativeFlow<T> {
    pub fn new(outcome: Result<Option<T>, FlowError>) -> Self {
        Self::with_context(outcome, PropagatedContext::default())
    }

    pub(crate) fn with_context(
        outcome: Result<Option<T>, FlowError>,
        context: PropagatedContext,
    ) -> Self {
        Self { outcome, context }
    }

    /// 取出值；失败或无值时返回 `None`。
    pub fn value(self) -> Option<T> {
        self.outcome.ok().flatten()
    }

    pub fn value_ref(&self) -> Option<&T> {
        self.outcome.as_ref().ok().and_then(Option::as_ref)
    }

    pub fn error(&self) -> Option<&FlowError> {
        self.outcome.as_ref().err()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<Option<T>, FlowError> {
        self.outcome
    }

    pub fn context(&self) -> &PropagatedContext {
        &self.context
    }

    pub(crate) fn into_parts(self) -> (Result<Option<T>, FlowError>, PropagatedContext) {
        (self.outcome, self.context)
    }

    /// 变换成功值。
    pub fn map<U>(self, f: impl FnOnce(Option<T>) -> Option<U>) -> ImperativeFlow<U> {
        self.try_map(|value| Ok(f(value)))
    }

    /// 以可失败的方式变换成功值。
    pub fn try_map<U>(
        self,
        f: impl FnOnce(Option<T>) -> Result<Option<U>, FlowError>,
    ) -> ImperativeFlow<U> {
        let Self { outcome, context } = self;
        let outcome = match outcome {
            Ok(value) => {
                let _scope = (!context.is_empty()).then(|| context.enter());
                catch_user_fault(|| f(value)).and_then(|result| result)
            }
            Err(error) => Err(error),
        };
        ImperativeFlow { outcome, context }
    }
}

impl<T: Send + 'static> ImperativeFlow<T> {
    /// 转回通用执行流以继续链式调用。
    pub fn into_flow(self) -> Flow<T> {
        Flow::from(self)
    }
}

impl<T> From<Result<Option<T>, FlowError>> for ImperativeFlow<T> {
    fn from(outcome: Result<Option<T>, FlowError>) -> Self {
        Self::new(outcome)
    }
}

impl<T: fmt::Debug> fmt::Debug for ImperativeFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImperativeFlow")
            .field("outcome", &self.outcome)
            .field("context", &self.context)
            .finish()
    }
}
