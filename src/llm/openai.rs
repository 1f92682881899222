//! OpenAI 兼容 API 后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）：OpenAI、DeepSeek、NVIDIA integrate 等。
//! 请求按 chat.completions 线上格式组装，流式读取；工具调用分片按 index 累积，流结束时组装为 ToolCall。

use std::collections::BTreeMap;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionResponseStream, CreateChatCompletionRequest, FinishReason,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::{
    ChunkStream, LlmProvider, ModelChunk, ModelOutput, ModelRequest, ProviderError, StopReason,
    TokenUsage,
};
use crate::memory::{ToolCall, TurnContent};

/// OpenAI 兼容后端：持有 Client 与 model 名
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<String>) -> Self {
        let api_key = api_key.unwrap_or_else(|| {
            tracing::warn!("No API key for OpenAI-compatible provider, requests may be rejected");
            "sk-placeholder".to_string()
        });
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    /// 组装 chat.completions 请求体（线上 JSON 格式）
    pub(crate) fn request_body(&self, request: &ModelRequest) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        for turn in &request.turns {
            match &turn.content {
                TurnContent::Text { text } => {
                    messages.push(json!({ "role": "user", "content": text }));
                }
                TurnContent::ModelOutput { text, tool_calls } => {
                    let mut message = json!({ "role": "assistant" });
                    if !text.is_empty() {
                        message["content"] = json!(text);
                    }
                    if !tool_calls.is_empty() {
                        message["tool_calls"] = tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.correlation_id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string(),
                                    }
                                })
                            })
                            .collect();
                    }
                    messages.push(message);
                }
                TurnContent::ToolResult { result } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": result.correlation_id,
                        "content": result.render(),
                    }));
                }
            }
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.input_schema,
                        }
                    })
                })
                .collect();
        }
        let options = &request.options;
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

struct StreamState {
    inner: ChatCompletionResponseStream,
    cancel: CancellationToken,
    text: String,
    calls: BTreeMap<u32, PartialCall>,
    stop_reason: StopReason,
    usage: TokenUsage,
    done: bool,
}

impl StreamState {
    fn finish(&mut self) -> ModelOutput {
        let tool_calls: Vec<ToolCall> = std::mem::take(&mut self.calls)
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| ToolCall::new(c.id, c.name, parse_arguments(&c.arguments)))
            .collect();
        let stop_reason = if !tool_calls.is_empty() && self.stop_reason == StopReason::EndTurn {
            StopReason::ToolUse
        } else {
            self.stop_reason
        };
        ModelOutput {
            text: std::mem::take(&mut self.text),
            tool_calls,
            stop_reason,
            usage: self.usage,
        }
    }
}

/// 参数不是合法 JSON 时保留原始字符串，交给 schema 校验报 InvalidArguments
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn map_finish_reason(reason: &FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::Length => StopReason::MaxTokens,
        _ => StopReason::Other,
    }
}

/// 限流按结构化字段判断：HTTP 429，或 API 错误码 rate_limit_exceeded（流式请求的 429 会被解析为 ApiError）
pub(crate) fn classify_error(err: OpenAIError) -> ProviderError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
                ProviderError::Throttled {
                    retry_after_ms: None,
                    detail: e.to_string(),
                }
            } else {
                ProviderError::Transport(e.to_string())
            }
        }
        OpenAIError::ApiError(api) if is_rate_limit(&api) => ProviderError::Throttled {
            retry_after_ms: None,
            detail: api.message,
        },
        OpenAIError::ApiError(api) => ProviderError::Api {
            status: None,
            message: api.message,
        },
        other => ProviderError::Api {
            status: None,
            message: other.to_string(),
        },
    }
}

fn is_rate_limit(api: &ApiError) -> bool {
    const RATE_LIMIT: &str = "rate_limit_exceeded";
    api.code.as_deref() == Some(RATE_LIMIT) || api.r#type.as_deref() == Some(RATE_LIMIT)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(&request);
        let req: CreateChatCompletionRequest =
            serde_json::from_value(body).map_err(|e| ProviderError::Config(e.to_string()))?;

        let chat = self.client.chat();
        let inner = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            res = chat.create_stream(req) => res.map_err(classify_error)?,
        };

        let state = StreamState {
            inner,
            cancel,
            text: String::new(),
            calls: BTreeMap::new(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
            done: false,
        };

        let chunks = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                let next = tokio::select! {
                    _ = st.cancel.cancelled() => None,
                    item = st.inner.next() => Some(item),
                };
                let item = match next {
                    None => {
                        st.done = true;
                        return Some((Err(ProviderError::Cancelled), st));
                    }
                    Some(item) => item,
                };
                match item {
                    Some(Ok(response)) => {
                        if let Some(usage) = &response.usage {
                            st.usage = TokenUsage {
                                prompt_tokens: usage.prompt_tokens as u64,
                                completion_tokens: usage.completion_tokens as u64,
                            };
                        }
                        let mut delta = String::new();
                        for choice in response.choices {
                            if let Some(content) = choice.delta.content {
                                delta.push_str(&content);
                            }
                            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                                let entry = st.calls.entry(fragment.index).or_default();
                                if let Some(id) = fragment.id {
                                    entry.id = id;
                                }
                                if let Some(function) = fragment.function {
                                    if let Some(name) = function.name {
                                        entry.name.push_str(&name);
                                    }
                                    if let Some(arguments) = function.arguments {
                                        entry.arguments.push_str(&arguments);
                                    }
                                }
                            }
                            if let Some(reason) = &choice.finish_reason {
                                st.stop_reason = map_finish_reason(reason);
                            }
                        }
                        if !delta.is_empty() {
                            st.text.push_str(&delta);
                            return Some((Ok(ModelChunk::Delta(delta)), st));
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(classify_error(e)), st));
                    }
                    None => {
                        st.done = true;
                        let output = st.finish();
                        return Some((Ok(ModelChunk::Final(output)), st));
                    }
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelOptions;
    use crate::memory::{ToolResult, TurnLog};
    use crate::tools::ToolSpec;

    #[test]
    fn test_request_body_maps_turns_and_tools() {
        let provider = OpenAiProvider::new(None, "gpt-4o-mini", Some("sk-test".into()));
        let mut log = TurnLog::new();
        log.push_user("add 1 and 2");
        let call = ToolCall::new("call_1", "add", json!({"a": 1, "b": 2}));
        log.push_model("", vec![call.clone()]);
        log.accept_result(ToolResult::success(&call, json!(3), 5))
            .unwrap();

        let request = ModelRequest {
            system: "be brief".into(),
            turns: log.turns().to_vec(),
            tools: vec![ToolSpec {
                name: "add".into(),
                description: "Add two numbers".into(),
                input_schema: json!({"type": "object"}),
            }],
            options: ModelOptions::default(),
        };
        let body = provider.request_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            json!({"a": 1, "b": 2}).to_string()
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "add");
        assert_eq!(body["max_tokens"], 2048);

        let typed: Result<CreateChatCompletionRequest, _> = serde_json::from_value(body);
        assert!(typed.is_ok());
    }

    fn api_error(message: &str, r#type: Option<&str>, code: Option<&str>) -> OpenAIError {
        OpenAIError::ApiError(ApiError {
            message: message.into(),
            r#type: r#type.map(String::from),
            param: None,
            code: code.map(String::from),
        })
    }

    #[test]
    fn test_rate_limit_is_classified_by_code() {
        let err = classify_error(api_error(
            "Rate limit reached for requests",
            Some("requests"),
            Some("rate_limit_exceeded"),
        ));
        assert!(err.is_throttled());

        let err = classify_error(api_error("slow down", Some("rate_limit_exceeded"), None));
        assert!(err.is_throttled());
    }

    #[test]
    fn test_message_text_does_not_imply_throttling() {
        let err = classify_error(api_error(
            "prompt mentions 429 and rate limit",
            Some("invalid_request_error"),
            None,
        ));
        assert!(!err.is_throttled());

        let err = classify_error(api_error(
            "You exceeded your current quota",
            Some("insufficient_quota"),
            Some("insufficient_quota"),
        ));
        assert!(!err.is_throttled());
    }

    #[test]
    fn test_parse_arguments_keeps_malformed_raw() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments(r#"{"x":1}"#), json!({"x": 1}));
        assert_eq!(parse_arguments("{oops"), json!("{oops"));
    }
}
