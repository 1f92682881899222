//! 带重试的审计发射器
//!
//! 每次尝试有独立超时；失败后按 RetryPolicy 退避，次数用尽返回 `AuditError::Exhausted`。

use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditError, AuditEvent, AuditSink};
use crate::core::RetryPolicy;

#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
    attempt_timeout: Duration,
    retry: RetryPolicy,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>, attempt_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            sink,
            attempt_timeout,
            retry,
        }
    }

    pub async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, self.sink.emit(&event))
                .await
            {
                Ok(res) => res,
                Err(_) => Err(AuditError::Timeout(self.attempt_timeout.as_millis() as u64)),
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !self.retry.should_retry(attempt) {
                tracing::error!(
                    task_id = %event.task_id,
                    kind = ?event.kind,
                    attempts = attempt,
                    error = %err,
                    "Audit write failed, retries exhausted"
                );
                return Err(AuditError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
            let delay = self.retry.delay_for(attempt, None);
            tracing::warn!(
                task_id = %event.task_id,
                kind = ?event.kind,
                attempt,
                error = %err,
                "Audit write failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditKind;
    use crate::core::TaskId;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AuditSink for Flaky {
        async fn emit(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err(AuditError::Transport("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
    }

    fn event() -> AuditEvent {
        AuditEvent::task(&TaskId::new(), AuditKind::TaskAuthorized, json!({}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let sink = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let emitter = AuditEmitter::new(sink.clone(), Duration::from_secs(1), policy());
        emitter.emit(event()).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_error() {
        let sink = Arc::new(Flaky {
            failures_left: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let emitter = AuditEmitter::new(sink.clone(), Duration::from_secs(1), policy());
        let err = emitter.emit(event()).await.unwrap_err();
        assert!(matches!(err, AuditError::Exhausted { attempts: 3, .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }
}
