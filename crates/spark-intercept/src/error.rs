//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 分派器自身的失败只有两类：配置/形态不匹配的致命错误，以及需要原样抛回给调用方的业务失败；
//! - 业务失败已经是 [`FlowError`]，此处只做包装，不改变其身份。
//!
//! ## 设计要求（What）
//! - 每个变体映射到稳定的 `intercept.*` 错误码；
//! - `From<InterceptError> for FlowError` 让策略内部可以直接把致命错误塞进执行流；
//!   `Propagated` 变体还原为原始失败实例。

use std::borrow::Cow;

use spark_flow::FlowError;
use thiserror::Error;

/// 分派器稳定错误码。
pub mod codes {
    pub const ILLEGAL_STATE: &str = "intercept.illegal_state";
    pub const CONVERSION: &str = "intercept.conversion";
    pub const NULL_RESULT: &str = "intercept.null_result";
    pub const CONFIG: &str = "intercept.config";
}

/// 分派器错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“拦截链与返回类型不匹配”这类不可重试的编程错误，与调用方应当按原语义处理的业务失败；
/// - **契约 (What)**：
///   - `IllegalState`：链产出的原始结果形态与分类结论不符（例如 Future 策略拿到了普通值）；
///   - `Conversion`：结果既不可直接赋值给声明类型，转换服务也无法转换；
///   - `NullResult`：挂起方法产出空值，而声明类型既非 void 也不可空；
///   - `Config`：配置解析失败或引用了未启用的特性；
///   - `Propagated`：同步策略原样抛回的业务失败。
/// - **设计权衡 (Trade-offs)**：上下文以 `String` 保存，牺牲少量分配换取可读的排障信息。
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("illegal state: {0}")]
    IllegalState(Cow<'static, str>),

    #[error("cannot convert result of `{method}` to `{target}`")]
    Conversion { method: String, target: &'static str },

    #[error("suspend method `{method}` produced no value but `{target}` is neither void nor nullable")]
    NullResult { method: String, target: &'static str },

    #[error("invalid dispatcher configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Propagated(#[from] FlowError),
}

impl InterceptError {
    pub fn illegal_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::IllegalState(message.into())
    }

    /// 稳定错误码；`Propagated` 返回被包装失败自身的码值。
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalState(_) => codes::ILLEGAL_STATE,
            Self::Conversion { .. } => codes::CONVERSION,
            Self::NullResult { .. } => codes::NULL_RESULT,
            Self::Config(_) => codes::CONFIG,
            Self::Propagated(error) => error.code(),
        }
    }
}

impl From<InterceptError> for FlowError {
    fn from(error: InterceptError) -> Self {
        match error {
            InterceptError::Propagated(inner) => inner,
            other => FlowError::new(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagated_round_trips_to_the_same_failure() {
        let original = FlowError::new(spark_flow::codes::APPLICATION, "business");
        let back = FlowError::from(InterceptError::from(original.clone()));
        assert!(back.ptr_eq(&original));
    }

    #[test]
    fn fatal_variants_map_to_intercept_codes() {
        let error = FlowError::from(InterceptError::Conversion {
            method: "find".into(),
            target: "Stage",
        });
        assert_eq!(error.code(), codes::CONVERSION);
        assert!(error.message().contains("`find`"));
    }
}
