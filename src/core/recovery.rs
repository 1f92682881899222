//! 错误恢复引擎
//!
//! 根据 KernelError 类型返回 Disposition：局部可恢复的故障被吸收并回灌上下文，
//! 系统性故障终止任务并保留错误类型，取消与超时直接进入 CANCELLED。

use crate::core::{FailureKind, KernelError};

/// 恢复引擎给出的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 降级继续（如记忆库不可用）
    Absorb,
    /// 退避后重试当前步骤（如模型限流）
    Retry,
    /// 任务进入 FAILED
    Fail(FailureKind),
    /// 任务进入 CANCELLED
    Cancel(FailureKind),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn disposition(&self, err: &KernelError) -> Disposition {
        match err {
            KernelError::MemoryUnavailable(_) => Disposition::Absorb,
            KernelError::Provider(e) if e.is_retryable() => Disposition::Retry,
            KernelError::Cancelled(_) | KernelError::DeadlineExceeded => {
                Disposition::Cancel(err.kind())
            }
            KernelError::Provider(crate::llm::ProviderError::Cancelled) => {
                Disposition::Cancel(FailureKind::Cancelled)
            }
            _ => Disposition::Fail(err.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderError;

    #[test]
    fn test_recovery_memory_is_absorbed() {
        let engine = RecoveryEngine::new();
        let err = KernelError::MemoryUnavailable("timeout".into());
        assert_eq!(engine.disposition(&err), Disposition::Absorb);
    }

    #[test]
    fn test_recovery_throttling_is_retried() {
        let engine = RecoveryEngine::new();
        let err = KernelError::Provider(ProviderError::Throttled {
            retry_after_ms: Some(100),
            detail: "429".into(),
        });
        assert_eq!(engine.disposition(&err), Disposition::Retry);
    }

    #[test]
    fn test_recovery_bad_request_fails() {
        let engine = RecoveryEngine::new();
        let err = KernelError::Provider(ProviderError::Api {
            status: Some(400),
            message: "bad".into(),
        });
        assert_eq!(
            engine.disposition(&err),
            Disposition::Fail(FailureKind::ProviderError)
        );
    }

    #[test]
    fn test_recovery_systemic_faults_fail() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.disposition(&KernelError::AuditUnavailable("down".into())),
            Disposition::Fail(FailureKind::AuditUnavailable)
        );
        assert_eq!(
            engine.disposition(&KernelError::AuthzUnavailable("down".into())),
            Disposition::Fail(FailureKind::AuthzUnavailable)
        );
        assert_eq!(
            engine.disposition(&KernelError::AuthzDenied("policy".into())),
            Disposition::Fail(FailureKind::AuthzDenied)
        );
    }

    #[test]
    fn test_recovery_cancellation() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.disposition(&KernelError::DeadlineExceeded),
            Disposition::Cancel(FailureKind::DeadlineExceeded)
        );
        assert_eq!(
            engine.disposition(&KernelError::Cancelled("user".into())),
            Disposition::Cancel(FailureKind::Cancelled)
        );
        assert_eq!(
            engine.disposition(&KernelError::Provider(ProviderError::Cancelled)),
            Disposition::Cancel(FailureKind::Cancelled)
        );
    }
}
