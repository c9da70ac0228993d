//! 分派器配置。
//!
//! # 设计背景（Why）
//! - 分类顺序中的 `String` 快速路径与 Publisher 的上下文传播都是可选行为，部署方需要按场景开关；
//! - 把 `Stage` 转成推送式执行流时需要执行器，其种类同样由配置决定。
//!
//! # 契约说明（What）
//! - 所有键均可省略，省略即取默认值；未知键视为配置错误；
//! - 解析与构建执行器的失败统一返回 [`InterceptError::Config`]。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spark_flow::{Executor, InlineExecutor, ThreadExecutor};

use crate::error::InterceptError;

/// 将 `Stage` 转为执行流时使用的执行器种类。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// 在调用线程上阻塞驱动。
    Inline,
    /// 每个任务一条具名线程。
    #[default]
    Thread,
    /// 当前 Tokio 运行时；需要 `runtime-tokio` 特性。
    Tokio,
}

/// 分派器配置。
///
/// ```toml
/// string_fast_path = false
/// context_propagation = true
/// executor = "inline"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// `String` 返回类型是否直接走同步策略。
    pub string_fast_path: bool,
    /// Publisher 策略是否把订阅前的环境上下文带入流中。
    pub context_propagation: bool,
    pub executor: ExecutorKind,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            string_fast_path: true,
            context_propagation: true,
            executor: ExecutorKind::default(),
        }
    }
}

impl DispatcherConfig {
    /// 从 TOML 文本解析。
    pub fn from_toml_str(raw: &str) -> Result<Self, InterceptError> {
        toml::from_str(raw).map_err(|err| InterceptError::Config(err.to_string()))
    }

    /// 按 `executor` 键构建执行器。
    pub fn build_executor(&self) -> Result<Arc<dyn Executor>, InterceptError> {
        match self.executor {
            ExecutorKind::Inline => Ok(Arc::new(InlineExecutor)),
            ExecutorKind::Thread => Ok(Arc::new(ThreadExecutor::new("spark-intercept"))),
            ExecutorKind::Tokio => tokio_executor(),
        }
    }
}

#[cfg(feature = "runtime-tokio")]
fn tokio_executor() -> Result<Arc<dyn Executor>, InterceptError> {
    spark_flow::TokioExecutor::current()
        .map(|executor| Arc::new(executor) as Arc<dyn Executor>)
        .map_err(|err| InterceptError::Config(format!("executor = \"tokio\": {err}")))
}

#[cfg(not(feature = "runtime-tokio"))]
fn tokio_executor() -> Result<Arc<dyn Executor>, InterceptError> {
    Err(InterceptError::Config(
        "executor = \"tokio\" requires the `runtime-tokio` feature".into(),
    ))
}
