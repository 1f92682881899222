//! LLM 后端抽象
//!
//! 所有后端（OpenAI 兼容 / Bedrock / Mock）实现 LlmProvider：invoke 返回分片流，
//! 以 `ModelChunk::Final` 结束（可能携带 ToolCall），或以 ProviderError 结束。
//! 各后端负责把自己的工具调用编码归一化为 `ToolCall`，把限流归一化为 `ProviderError::Throttled`。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::{ToolCall, Turn};
use crate::tools::ToolSpec;

/// 采样参数，透传给后端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.0),
            top_p: Some(0.95),
            max_tokens: Some(2048),
        }
    }
}

/// 一次模型调用的完整输入
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolSpec>,
    pub options: ModelOptions,
}

/// 归一化后的停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// 组装完成的模型输出（候选 Turn）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// 增量文本
    Delta(String),
    /// 终止分片
    Final(ModelOutput),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ProviderError>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// 限流；可带服务端建议的等待时间
    #[error("provider throttled: {detail}")]
    Throttled {
        retry_after_ms: Option<u64>,
        detail: String,
    },
    #[error("provider api error ({status:?}): {message}")]
    Api { status: Option<u16>, message: String },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("model invocation timed out after {0} ms")]
    Timeout(u64),
    #[error("model invocation cancelled")]
    Cancelled,
    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, ProviderError::Throttled { .. })
    }

    /// 可重试：限流、传输错误、超时、5xx
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Throttled { .. }
            | ProviderError::Transport(_)
            | ProviderError::Timeout(_) => true,
            ProviderError::Api { status, .. } => matches!(status, Some(s) if *s >= 500),
            ProviderError::Decode(_) | ProviderError::Cancelled | ProviderError::Config(_) => {
                false
            }
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::Throttled { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// LLM 后端 trait：按配置互换
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// 后端名（日志与审计用）
    fn name(&self) -> &str;

    /// 发起调用，返回分片流；cancel 触发后流应尽快结束
    async fn invoke(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Throttled {
            retry_after_ms: None,
            detail: "slow down".into()
        }
        .is_retryable());
        assert!(ProviderError::Api {
            status: Some(503),
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            status: Some(400),
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
        assert!(!ProviderError::Decode("x".into()).is_retryable());
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        usage.add(TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 2,
        });
        assert_eq!(usage.total(), 20);
    }
}
