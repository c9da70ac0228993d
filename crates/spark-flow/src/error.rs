use std::{
    any::Any,
    borrow::Cow,
    error::Error as StdError,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// 稳定错误码集合，遵循 `<域>.<语义>` 命名约定。
///
/// # 设计背景（Why）
/// - 执行流内的失败以数据形式流转，下游只能依靠稳定码值判断处置策略，而非解析消息文本；
/// - 拦截调度 crate 在此基础上追加 `intercept.*` 码值，两者共用同一命名空间规则。
pub mod codes {
    /// 用户提供的变换闭包发生 panic。
    pub const USER_FUNCTION_PANICKED: &str = "flow.user_function_panicked";
    /// 同一 Step 被重复写入输出。
    pub const ALREADY_COMPLETED: &str = "flow.already_completed";
    /// 同一 Step 被重复挂载后继。
    pub const ALREADY_ATTACHED: &str = "flow.already_attached";
    /// 包装型“完成异常”，需经 [`FlowError::unwrap_completion`] 还原根因。
    pub const COMPLETION: &str = "flow.completion";
    /// 底层 Future 在产出结果前被丢弃或取消。
    pub const CANCELLED: &str = "flow.cancelled";
    /// 类型擦除的输出无法还原为期望类型。
    pub const TYPE_MISMATCH: &str = "flow.type_mismatch";
    /// 执行器拒绝接收任务。
    pub const EXECUTOR_REJECTED: &str = "flow.executor_rejected";
    /// 引擎内部状态机违例。
    pub const ILLEGAL_STATE: &str = "flow.illegal_state";
    /// 由业务错误转换而来的通用失败。
    pub const APPLICATION: &str = "app.failure";
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以便跨线程共享。
pub type ErrorCause = Arc<dyn StdError + Send + Sync + 'static>;

/// `FlowError` 是在执行流中传递的唯一失败载体。
///
/// # 设计背景（Why）
/// - 失败需要与成功值走同一条通道：它会被存入 Step、交给回调、被 `on_error_resume` 消费，
///   因此必须能够廉价克隆并安全跨线程移动；
/// - 与 `spark-core` 的 `CoreError` 一致，错误码 `code` 为 `'static` 稳定字符串，
///   `message` 面向排障人员，`cause` 串联底层错误链。
///
/// # 逻辑解析（How）
/// - 内部状态以 `Arc` 共享，`clone` 只增加引用计数；
/// - Builder 风格的 `with_cause` 在独占时原地修改，被共享时复制后修改，保持不可变语义。
///
/// # 契约说明（What）
/// - **相等性**：`PartialEq` 比较错误码与消息，用于断言“收到的就是那个错误”；
///   需要判断是否为同一实例时使用 [`FlowError::ptr_eq`]；
/// - **后置条件**：构造后不会被框架修改，`source()` 返回构造时附带的原因。
#[derive(Clone)]
pub struct FlowError {
    inner: Arc<FlowErrorInner>,
}

#[derive(Clone)]
struct FlowErrorInner {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl FlowError {
    /// 使用稳定错误码与消息构造失败。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(FlowErrorInner {
                code,
                message: message.into(),
                cause: None,
            }),
        }
    }

    /// 将任意标准错误包装为 `app.failure`，消息取自其 `Display`。
    pub fn from_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::new(codes::APPLICATION, error.to_string()).with_cause(error)
    }

    /// 附带底层原因并返回新的失败。
    pub fn with_cause(self, cause: impl StdError + Send + Sync + 'static) -> Self {
        let mut inner = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| (*shared).clone());
        inner.cause = Some(Arc::new(cause));
        Self {
            inner: Arc::new(inner),
        }
    }

    /// 构造包装型“完成异常”。
    ///
    /// # 设计意图（Why）
    /// - 标准 Future 组合或取消时，真实失败常被外层包装一次；执行流在入口处统一剥除这层包装，
    ///   让回调看到的永远是根因。
    pub fn completion(cause: FlowError) -> Self {
        let message = format!("completion failed: {}", cause.message());
        Self::new(codes::COMPLETION, message).with_cause(cause)
    }

    /// 剥除一层或多层完成包装，返回根因；非包装错误原样返回。
    pub fn unwrap_completion(self) -> FlowError {
        let mut current = self;
        while current.is(codes::COMPLETION) {
            let root = current
                .inner
                .cause
                .as_ref()
                .and_then(|cause| cause.downcast_ref::<FlowError>())
                .cloned();
            match root {
                Some(root) => current = root,
                None => break,
            }
        }
        current
    }

    /// 重复完成 Step 时返回的状态违例。
    pub fn already_completed() -> Self {
        Self::new(
            codes::ALREADY_COMPLETED,
            "flow step already holds an output; a flow can only be completed once",
        )
    }

    /// 重复挂载后继时返回的状态违例。
    pub fn already_attached() -> Self {
        Self::new(
            codes::ALREADY_ATTACHED,
            "flow step already has a continuation attached",
        )
    }

    /// 引擎内部状态违例。
    pub fn illegal_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::ILLEGAL_STATE, message)
    }

    /// 将 panic 载荷转换为 `flow.user_function_panicked`。
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&'static str>()
            .map(|text| Cow::Borrowed(*text))
            .or_else(|| {
                payload
                    .downcast_ref::<String>()
                    .map(|text| Cow::Owned(text.clone()))
            })
            .unwrap_or(Cow::Borrowed("non-string panic payload"));
        Self::new(
            codes::USER_FUNCTION_PANICKED,
            format!("user function panicked: {detail}"),
        )
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.inner.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.inner.cause.as_ref()
    }

    /// 判断错误码是否匹配。
    pub fn is(&self, code: &str) -> bool {
        self.inner.code == code
    }

    /// 判断两个句柄是否指向同一失败实例。
    pub fn ptr_eq(&self, other: &FlowError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowError")
            .field("code", &self.inner.code)
            .field("message", &self.inner.message)
            .field("has_cause", &self.inner.cause.is_some())
            .finish()
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.inner.code, self.inner.message)
    }
}

impl PartialEq for FlowError {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || (self.code() == other.code() && self.message() == other.message())
    }
}

impl StdError for FlowError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn StdError + 'static))
    }
}

/// 在隔离边界内执行用户闭包，把 panic 转换为失败数据。
///
/// # 契约说明（What）
/// - **输入**：任意一次性闭包；
/// - **返回值**：闭包正常返回时为 `Ok`，发生 panic 时为 `flow.user_function_panicked`；
/// - **风险提示**：使用 `AssertUnwindSafe`，闭包捕获的共享状态在 panic 后可能处于中间态，
///   调用方不应继续信任这些状态。
pub(crate) fn catch_user_fault<R>(f: impl FnOnce() -> R) -> Result<R, FlowError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(FlowError::from_panic)
}
