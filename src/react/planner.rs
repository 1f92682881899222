//! Planner：单次模型调用
//!
//! 拼 system prompt + Turn 序列 + 工具声明，调用后端并累积流式分片为 ModelOutput；
//! 每次尝试受 model_timeout 约束，可重试的后端错误按 RetryPolicy 退避重试。
//! 重试前发出 Retrying：此前各次尝试的增量文本作废。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::{Disposition, KernelError, RecoveryEngine, RetryPolicy, TaskSupervisor};
use crate::llm::{LlmProvider, ModelChunk, ModelOptions, ModelOutput, ModelRequest, ProviderError};
use crate::memory::Turn;
use crate::tools::ToolSpec;

/// 调用过程中的进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlannerEvent<'a> {
    Delta(&'a str),
    /// 第 failed_attempt 次尝试失败，delay 后重试
    Retrying { failed_attempt: u32, delay: Duration },
}

/// Planner：持有 LLM 后端、system prompt、采样参数与重试策略
pub struct Planner {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    options: ModelOptions,
    retry: RetryPolicy,
    model_timeout: Duration,
    recovery: RecoveryEngine,
}

impl Planner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        system_prompt: impl Into<String>,
        options: ModelOptions,
        retry: RetryPolicy,
        model_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.into(),
            options,
            retry,
            model_timeout,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// 调用模型直到得到终止输出；on_event 收到增量文本与重试标记
    pub async fn invoke(
        &self,
        turns: &[Turn],
        tools: Vec<ToolSpec>,
        supervisor: &TaskSupervisor,
        on_event: &(dyn Fn(PlannerEvent<'_>) + Send + Sync),
    ) -> Result<ModelOutput, KernelError> {
        let request = ModelRequest {
            system: self.system_prompt.clone(),
            turns: turns.to_vec(),
            tools,
            options: self.options.clone(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let once = self.invoke_once(request.clone(), supervisor.token(), on_event);
            let result = match supervisor.guard(tokio::time::timeout(self.model_timeout, once)).await? {
                Ok(res) => res,
                Err(_) => Err(ProviderError::Timeout(self.model_timeout.as_millis() as u64)),
            };
            let err = match result {
                Ok(output) => return Ok(output),
                Err(ProviderError::Cancelled) if supervisor.is_cancelled() => {
                    return Err(supervisor.cancel_error());
                }
                Err(e) => KernelError::Provider(e),
            };

            match self.recovery.disposition(&err) {
                Disposition::Retry if self.retry.should_retry(attempt) => {
                    let hint = match &err {
                        KernelError::Provider(e) => e.retry_after_ms().map(Duration::from_millis),
                        _ => None,
                    };
                    let delay = self.retry.delay_for(attempt, hint);
                    tracing::warn!(
                        provider = self.provider.name(),
                        attempt,
                        error = %err,
                        "Model invocation failed, retrying in {:?}",
                        delay
                    );
                    on_event(PlannerEvent::Retrying {
                        failed_attempt: attempt,
                        delay,
                    });
                    supervisor.guard(tokio::time::sleep(delay)).await?;
                }
                _ => {
                    tracing::error!(
                        provider = self.provider.name(),
                        attempt,
                        error = %err,
                        "Model invocation failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn invoke_once(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(PlannerEvent<'_>) + Send + Sync),
    ) -> Result<ModelOutput, ProviderError> {
        let token = cancel.child_token();
        // 超时丢弃本 future 时一并取消后端调用
        let _guard = token.clone().drop_guard();
        let mut stream = self.provider.invoke(request, token).await?;
        while let Some(chunk) = stream.next().await {
            match chunk? {
                ModelChunk::Delta(text) => on_event(PlannerEvent::Delta(&text)),
                ModelChunk::Final(output) => return Ok(output),
            }
        }
        Err(ProviderError::Decode(
            "stream ended without a final output".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Script, ScriptedProvider};
    use crate::memory::TurnLog;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn supervisor() -> TaskSupervisor {
        TaskSupervisor::new(
            &CancellationToken::new(),
            Instant::now() + Duration::from_secs(600),
            Duration::from_secs(1),
        )
    }

    fn planner(provider: Arc<ScriptedProvider>, attempts: u32) -> Planner {
        Planner::new(
            provider,
            "system",
            ModelOptions::default(),
            RetryPolicy::new(attempts, Duration::from_millis(250), Duration::from_secs(2)),
            Duration::from_secs(5),
        )
    }

    fn turns() -> Vec<Turn> {
        let mut log = TurnLog::new();
        log.push_user("hello");
        log.turns().to_vec()
    }

    fn throttled() -> ProviderError {
        ProviderError::Throttled {
            retry_after_ms: None,
            detail: "429".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_is_retried_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::Fail(throttled()),
            Script::text("done"),
        ]));
        let deltas = Mutex::new(String::new());
        let out = planner(provider.clone(), 3)
            .invoke(&turns(), vec![], &supervisor(), &|ev| {
                if let PlannerEvent::Delta(d) = ev {
                    deltas.lock().unwrap().push_str(d)
                }
            })
            .await
            .unwrap();
        assert_eq!(out.text, "done");
        assert_eq!(deltas.lock().unwrap().as_str(), "done");
        assert_eq!(provider.invocations(), 2);
        assert_eq!(provider.requests()[0].system, "system");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Fail(throttled())]));
        let err = planner(provider.clone(), 3)
            .invoke(&turns(), vec![], &supervisor(), &|_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::FailureKind::ProviderThrottled);
        assert_eq!(provider.invocations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Fail(ProviderError::Api {
            status: Some(400),
            message: "bad".into(),
        })]));
        let err = planner(provider.clone(), 4)
            .invoke(&turns(), vec![], &supervisor(), &|_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::FailureKind::ProviderError);
        assert_eq!(provider.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_timeout_counts_as_retryable_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::Delay(Duration::from_secs(60), ModelOutput::default()),
            Script::text("second try"),
        ]));
        let out = planner(provider.clone(), 2)
            .invoke(&turns(), vec![], &supervisor(), &|_| {})
            .await
            .unwrap();
        assert_eq!(out.text, "second try");
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_stream_is_retried_behind_a_marker() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::BreakMidStream {
                partial: "par".into(),
                error: ProviderError::Transport("reset".into()),
            },
            Script::text("whole"),
        ]));
        let seen = Mutex::new(Vec::new());
        let out = planner(provider, 2)
            .invoke(&turns(), vec![], &supervisor(), &|ev| {
                let entry = match ev {
                    PlannerEvent::Delta(d) => d.to_string(),
                    PlannerEvent::Retrying { failed_attempt, .. } => format!("<retry {failed_attempt}>"),
                };
                seen.lock().unwrap().push(entry);
            })
            .await
            .unwrap();
        assert_eq!(out.text, "whole");

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("par"));
        let marker = seen.iter().position(|e| e == "<retry 1>").unwrap();
        assert_eq!(seen[marker + 1..].concat(), "whole");
    }
}
