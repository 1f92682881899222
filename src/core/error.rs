//! 内核错误类型与对外失败分类
//!
//! 与 RecoveryEngine 配合：根据 KernelError 决定吸收、重试、失败或取消。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::ProviderError;

/// 调用方看到的失败类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthzDenied,
    AuthzUnavailable,
    ProviderThrottled,
    ProviderError,
    AuditUnavailable,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

/// 任务执行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum KernelError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authorization denied: {0}")]
    AuthzDenied(String),

    #[error("Authorization service unavailable: {0}")]
    AuthzUnavailable(String),

    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("Audit sink unavailable: {0}")]
    AuditUnavailable(String),

    /// 记忆库不可用：降级处理，不终止任务
    #[error("Memory store unavailable: {0}")]
    MemoryUnavailable(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Task deadline exceeded")]
    DeadlineExceeded,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KernelError {
    pub fn kind(&self) -> FailureKind {
        match self {
            KernelError::AuthzDenied(_) => FailureKind::AuthzDenied,
            KernelError::AuthzUnavailable(_) => FailureKind::AuthzUnavailable,
            KernelError::Provider(e) if e.is_throttled() => FailureKind::ProviderThrottled,
            KernelError::Provider(ProviderError::Cancelled) => FailureKind::Cancelled,
            KernelError::Provider(_) => FailureKind::ProviderError,
            KernelError::AuditUnavailable(_) => FailureKind::AuditUnavailable,
            KernelError::Cancelled(_) => FailureKind::Cancelled,
            KernelError::DeadlineExceeded => FailureKind::DeadlineExceeded,
            KernelError::InvalidRequest(_)
            | KernelError::MemoryUnavailable(_)
            | KernelError::Config(_)
            | KernelError::Internal(_) => FailureKind::Internal,
        }
    }
}

impl From<ProviderError> for KernelError {
    fn from(err: ProviderError) -> Self {
        KernelError::Provider(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_preserves_provider_throttling() {
        let err = KernelError::from(ProviderError::Throttled {
            retry_after_ms: None,
            detail: "slow down".into(),
        });
        assert_eq!(err.kind(), FailureKind::ProviderThrottled);
        let err = KernelError::from(ProviderError::Transport("reset".into()));
        assert_eq!(err.kind(), FailureKind::ProviderError);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(KernelError::DeadlineExceeded.kind()).unwrap(),
            serde_json::json!("deadline_exceeded")
        );
    }
}
