//! Mock 后端（用于测试与无 Key 本地运行）
//!
//! - `MockProvider`：收到用户指令时调用 `echo` 工具，拿到工具结果后回显为最终回复。
//! - `ScriptedProvider`：按脚本逐次返回，脚本用尽后重复最后一条；记录每次请求供断言。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::llm::{
    ChunkStream, LlmProvider, ModelChunk, ModelOutput, ModelRequest, ProviderError, StopReason,
    TokenUsage,
};
use crate::memory::{ToolCall, TurnContent};

/// 把输出切成若干 Delta 再接 Final
fn chunked(output: ModelOutput) -> ChunkStream {
    let mut items: Vec<Result<ModelChunk, ProviderError>> = output
        .text
        .split_inclusive(' ')
        .map(|piece| Ok(ModelChunk::Delta(piece.to_string())))
        .collect();
    items.push(Ok(ModelChunk::Final(output)));
    Box::pin(stream::iter(items))
}

#[derive(Debug, Default)]
pub struct MockProvider;

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(
        &self,
        request: ModelRequest,
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let has_echo = request.tools.iter().any(|t| t.name == "echo");
        let output = match request.turns.last().map(|t| &t.content) {
            Some(TurnContent::ToolResult { result }) => ModelOutput {
                text: format!("Echo from Mock: {}", result.render()),
                ..Default::default()
            },
            Some(TurnContent::Text { text }) if has_echo => ModelOutput {
                text: String::new(),
                tool_calls: vec![ToolCall::new("", "echo", json!({ "text": text }))],
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage::default(),
            },
            Some(TurnContent::Text { text }) | Some(TurnContent::ModelOutput { text, .. }) => {
                ModelOutput {
                    text: format!("Echo from Mock: {text}"),
                    ..Default::default()
                }
            }
            None => ModelOutput {
                text: "(no input)".to_string(),
                ..Default::default()
            },
        };
        Ok(chunked(output))
    }
}

/// 单次调用的脚本
#[derive(Debug, Clone)]
pub enum Script {
    Reply(ModelOutput),
    /// invoke 直接返回错误
    Fail(ProviderError),
    /// 流在输出部分文本后以错误结束
    BreakMidStream { partial: String, error: ProviderError },
    /// 等待指定时长（或直到取消）后再回复
    Delay(Duration, ModelOutput),
}

impl Script {
    pub fn text(text: impl Into<String>) -> Self {
        Script::Reply(ModelOutput {
            text: text.into(),
            ..Default::default()
        })
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Script::Reply(ModelOutput {
            text: String::new(),
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage::default(),
        })
    }
}

pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    last: Mutex<Option<Script>>,
    invocations: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(None),
            invocations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_script(&self) -> Option<Script> {
        let popped = self.scripts.lock().ok()?.pop_front();
        let mut last = self.last.lock().ok()?;
        match popped {
            Some(script) => {
                *last = Some(script.clone());
                Some(script)
            }
            None => last.clone(),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        match self.next_script() {
            None => Err(ProviderError::Config("script exhausted".into())),
            Some(Script::Reply(output)) => Ok(chunked(output)),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::BreakMidStream { partial, error }) => Ok(Box::pin(stream::iter(vec![
                Ok(ModelChunk::Delta(partial)),
                Err(error),
            ]))),
            Some(Script::Delay(delay, output)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(chunked(output)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn request() -> ModelRequest {
        ModelRequest {
            system: String::new(),
            turns: vec![],
            tools: vec![],
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_scripted_repeats_last_script() {
        let provider = ScriptedProvider::new(vec![Script::text("a"), Script::text("b")]);
        let mut texts = Vec::new();
        for _ in 0..3 {
            let mut stream = provider
                .invoke(request(), CancellationToken::new())
                .await
                .unwrap();
            while let Some(chunk) = stream.next().await {
                if let Ok(ModelChunk::Final(out)) = chunk {
                    texts.push(out.text);
                }
            }
        }
        assert_eq!(texts, vec!["a", "b", "b"]);
        assert_eq!(provider.invocations(), 3);
    }

    #[tokio::test]
    async fn test_chunked_stream_ends_with_final() {
        let mut stream = chunked(ModelOutput {
            text: "hello big world".into(),
            ..Default::default()
        });
        let mut deltas = String::new();
        let mut final_seen = false;
        while let Some(chunk) = stream.next().await {
            match chunk.unwrap() {
                ModelChunk::Delta(d) => deltas.push_str(&d),
                ModelChunk::Final(out) => {
                    final_seen = true;
                    assert_eq!(out.text, deltas);
                }
            }
        }
        assert!(final_seen);
    }
}
