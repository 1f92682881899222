//! 工具派发器
//!
//! dispatch(call) 总是返回一个 ToolResult，不向上抛错：
//! 未知工具立即失败（不接触任何适配器），参数先按 schema 校验，执行受超时约束。
//! 超时后不再等待适配器；迟到的结果只记 warn 日志后丢弃。每次调用输出结构化审计日志（JSON）。
//! dispatch 的 future 被丢弃时（同轮其他调用失败、任务被放弃），适配器任务随之 abort。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::memory::{ToolCall, ToolErrorKind, ToolResult};
use crate::tools::{ToolInvocation, ToolRegistry, ToolSpec};

/// 工具派发器：对每次调用施加超时，并把各种失败归一为 ToolResult
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn knows(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    /// 未知工具的结果（不接触适配器）
    pub fn unknown(&self, call: &ToolCall) -> ToolResult {
        let result = ToolResult::failure(
            call,
            ToolErrorKind::UnknownTool,
            format!("unknown tool: {}", call.name),
            0,
        );
        log_audit(call, "unknown", 0);
        result
    }

    /// 授权拒绝的结果
    pub fn denied(&self, call: &ToolCall, reason: &str) -> ToolResult {
        log_audit(call, "denied", 0);
        ToolResult::failure(call, ToolErrorKind::AuthzDenied, reason, 0)
    }

    /// 执行一次工具调用；deadline 只透传给适配器，超时由本地计时器决定
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        deadline: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            return self.unknown(call);
        };
        if let Err(reason) = tool.schema.validate(&call.arguments) {
            log_audit(call, "invalid", 0);
            return ToolResult::failure(call, ToolErrorKind::InvalidArguments, reason, 0);
        }

        let local_deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let invocation = ToolInvocation {
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            correlation_id: call.correlation_id.clone(),
            deadline: match (deadline, local_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        };

        let start = Instant::now();
        let adapter = tool.adapter;
        let mut handle =
            AbortOnDropHandle::new(tokio::spawn(async move { adapter.invoke(invocation).await }));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                let ms = elapsed_ms(start);
                log_audit(call, "cancelled", ms);
                return ToolResult::failure(call, ToolErrorKind::Cancelled, "task cancelled", ms);
            }
            joined = &mut handle => joined,
            _ = tokio::time::sleep(self.timeout) => {
                let ms = elapsed_ms(start);
                log_audit(call, "timeout", ms);
                abandon(handle.detach(), call.correlation_id.clone(), self.timeout);
                return ToolResult::failure(
                    call,
                    ToolErrorKind::Timeout,
                    format!("no response within {} ms", self.timeout.as_millis()),
                    ms,
                );
            }
        };

        let ms = elapsed_ms(start);
        match result {
            Ok(Ok(response)) if response.success => {
                log_audit(call, "ok", ms);
                ToolResult::success(call, response.payload.unwrap_or(Value::Null), ms)
            }
            Ok(Ok(response)) => {
                log_audit(call, "error", ms);
                ToolResult::failure(
                    call,
                    ToolErrorKind::ExecutionError,
                    response
                        .error
                        .unwrap_or_else(|| "adapter reported failure".to_string()),
                    ms,
                )
            }
            Ok(Err(e)) => {
                log_audit(call, "error", ms);
                ToolResult::failure(call, ToolErrorKind::ExecutionError, e.to_string(), ms)
            }
            Err(join) => {
                log_audit(call, "error", ms);
                ToolResult::failure(
                    call,
                    ToolErrorKind::ExecutionError,
                    format!("adapter task failed: {join}"),
                    ms,
                )
            }
        }
    }
}

/// 放弃已超时的调用：最多再观察一个超时窗口，迟到结果只记日志
fn abandon<T: Send + 'static>(
    handle: tokio::task::JoinHandle<T>,
    correlation_id: String,
    window: Duration,
) {
    let abort = handle.abort_handle();
    tokio::spawn(async move {
        match tokio::time::timeout(window, handle).await {
            Ok(Ok(_)) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    "Late tool result after timeout discarded"
                );
            }
            Ok(Err(_)) => {}
            Err(_) => abort.abort(),
        }
    });
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn log_audit(call: &ToolCall, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.name,
        "correlation_id": call.correlation_id,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AdapterError, AdapterResponse, EchoTool, ToolAdapter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleepy {
        delay: Duration,
        calls: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolAdapter for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn invoke(&self, _inv: ToolInvocation) -> Result<AdapterResponse, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(AdapterResponse::ok(json!("late")))
        }
    }

    struct Broken;

    #[async_trait]
    impl ToolAdapter for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn invoke(&self, _inv: ToolInvocation) -> Result<AdapterResponse, AdapterError> {
            Err(AdapterError::Transport("connection refused".into()))
        }
    }

    fn dispatcher(timeout: Duration, calls: Arc<AtomicUsize>) -> ToolDispatcher {
        with_sleepy(timeout, calls, Arc::default())
    }

    fn with_sleepy(
        timeout: Duration,
        calls: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    ) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry.register(Broken).unwrap();
        registry
            .register(Sleepy {
                delay: Duration::from_secs(60),
                calls,
                done,
            })
            .unwrap();
        ToolDispatcher::new(Arc::new(registry), timeout)
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_fast() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let call = ToolCall::new("c1", "nope", json!({}));
        let result = d.dispatch(&call, None, &CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::UnknownTool));
        assert_eq!(result.correlation_id, "c1");
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_adapter() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let call = ToolCall::new("c2", "echo", json!({"txt": "typo"}));
        let result = d.dispatch(&call, None, &CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::InvalidArguments));
    }

    #[tokio::test]
    async fn test_success_and_execution_error() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let ok = d
            .dispatch(
                &ToolCall::new("c3", "echo", json!({"text": "hi"})),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(ok.is_success());
        let failed = d
            .dispatch(
                &ToolCall::new("c4", "broken", json!({})),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(failed.error_kind(), Some(ToolErrorKind::ExecutionError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_enforced_without_adapter_cooperation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(Duration::from_secs(2), calls.clone());
        let call = ToolCall::new("c5", "sleepy", json!({}));
        let result = d.dispatch(&call, None, &CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Timeout));
        assert!((2000..2100).contains(&result.duration_ms));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_dispatch() {
        let d = dispatcher(Duration::from_secs(30), Arc::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let call = ToolCall::new("c6", "sleepy", json!({}));
        let result = d.dispatch(&call, None, &cancel).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_dispatch_aborts_adapter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let d = with_sleepy(Duration::from_secs(120), calls.clone(), done.clone());
        let call = ToolCall::new("c7", "sleepy", json!({}));
        let dropped = tokio::time::timeout(
            Duration::from_millis(100),
            d.dispatch(&call, None, &CancellationToken::new()),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }
}
