//! AWS Bedrock Converse 后端
//!
//! 通过 reqwest 调用 `POST {endpoint}/model/{modelId}/converse`，鉴权使用 Bedrock API Key（Bearer）。
//! Turn 映射为 Converse 消息：工具调用为 `toolUse` 块，工具结果为 user 角色的 `toolResult` 块；
//! 相邻同角色消息合并。Converse 非流式，结果以一个 Delta 加 Final 的形式输出。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::{
    ChunkStream, LlmProvider, ModelChunk, ModelOutput, ModelRequest, ProviderError, StopReason,
    TokenUsage,
};
use crate::memory::{ToolCall, ToolOutcome, TurnContent};

pub struct BedrockProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl BedrockProvider {
    pub fn new(
        region: &str,
        endpoint: Option<&str>,
        model: &str,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        let endpoint = endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        if api_key.is_none() {
            tracing::warn!("No Bedrock API key configured, requests will be unauthenticated");
        }
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            api_key,
        })
    }

    fn converse_url(&self) -> Result<reqwest::Url, ProviderError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| ProviderError::Config(format!("invalid bedrock endpoint: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ProviderError::Config("bedrock endpoint cannot be a base".into()))?;
            segments
                .pop_if_empty()
                .push("model")
                .push(&self.model)
                .push("converse");
        }
        Ok(url)
    }

    /// 组装 Converse 请求体
    pub(crate) fn request_body(request: &ModelRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        for turn in &request.turns {
            let (role, blocks) = match &turn.content {
                TurnContent::Text { text } => ("user", vec![json!({ "text": text })]),
                TurnContent::ModelOutput { text, tool_calls } => {
                    let mut blocks = Vec::new();
                    if !text.is_empty() {
                        blocks.push(json!({ "text": text }));
                    }
                    for call in tool_calls {
                        blocks.push(json!({
                            "toolUse": {
                                "toolUseId": call.correlation_id,
                                "name": call.name,
                                "input": object_or_wrapped(&call.arguments),
                            }
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({ "text": "(empty)" }));
                    }
                    ("assistant", blocks)
                }
                TurnContent::ToolResult { result } => {
                    let (content, status) = match &result.outcome {
                        ToolOutcome::Success { payload } if payload.is_object() => {
                            (json!([{ "json": payload }]), "success")
                        }
                        ToolOutcome::Success { payload } => {
                            (json!([{ "text": payload.to_string() }]), "success")
                        }
                        ToolOutcome::Failure { .. } => {
                            (json!([{ "text": result.render() }]), "error")
                        }
                    };
                    (
                        "user",
                        vec![json!({
                            "toolResult": {
                                "toolUseId": result.correlation_id,
                                "content": content,
                                "status": status,
                            }
                        })],
                    )
                }
            };
            let same_role = messages.last().is_some_and(|last| last["role"] == role);
            if same_role {
                if let Some(content) = messages
                    .last_mut()
                    .and_then(|m| m["content"].as_array_mut())
                {
                    content.extend(blocks);
                }
            } else {
                messages.push(json!({ "role": role, "content": blocks }));
            }
        }

        let mut body = json!({
            "system": [{ "text": request.system }],
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|spec| {
                    json!({
                        "toolSpec": {
                            "name": spec.name,
                            "description": spec.description,
                            "inputSchema": { "json": spec.input_schema },
                        }
                    })
                })
                .collect();
            body["toolConfig"] = json!({ "tools": tools });
        }
        let mut inference = serde_json::Map::new();
        if let Some(m) = request.options.max_tokens {
            inference.insert("maxTokens".into(), json!(m));
        }
        if let Some(t) = request.options.temperature {
            inference.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.options.top_p {
            inference.insert("topP".into(), json!(p));
        }
        if !inference.is_empty() {
            body["inferenceConfig"] = Value::Object(inference);
        }
        body
    }
}

fn object_or_wrapped(arguments: &Value) -> Value {
    if arguments.is_object() {
        arguments.clone()
    } else {
        json!({ "raw": arguments })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ConverseUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: ConverseMessage,
}

#[derive(Debug, Deserialize)]
struct ConverseMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_use: Option<ToolUseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseBlock {
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(_) => StopReason::Other,
    }
}

impl ConverseResponse {
    fn into_output(self) -> ModelOutput {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in self.output.message.content {
            if let Some(t) = block.text {
                text.push_str(&t);
            }
            if let Some(tool_use) = block.tool_use {
                tool_calls.push(ToolCall::new(
                    tool_use.tool_use_id,
                    tool_use.name,
                    tool_use.input,
                ));
            }
        }
        ModelOutput {
            text,
            tool_calls,
            stop_reason: map_stop_reason(self.stop_reason.as_deref()),
            usage: self
                .usage
                .map(|u| TokenUsage {
                    prompt_tokens: u.input_tokens,
                    completion_tokens: u.output_tokens,
                })
                .unwrap_or_default(),
        }
    }
}

async fn classify_response(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let error_type = response
        .headers()
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000));
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["message"].as_str().map(String::from))
        .unwrap_or(body);

    if status.as_u16() == 429 || error_type.starts_with("ThrottlingException") {
        ProviderError::Throttled {
            retry_after_ms,
            detail: message,
        }
    } else {
        ProviderError::Api {
            status: Some(status.as_u16()),
            message,
        }
    }
}

#[async_trait]
impl LlmProvider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn invoke(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let url = self.converse_url()?;
        let mut builder = self
            .client
            .post(url)
            .json(&Self::request_body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            res = builder.send() => res.map_err(|e| ProviderError::Transport(e.to_string()))?,
        };
        if !response.status().is_success() {
            return Err(classify_response(response).await);
        }
        let parsed: ConverseResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            res = response.json() => res.map_err(|e| ProviderError::Decode(e.to_string()))?,
        };
        let output = parsed.into_output();

        let mut chunks = Vec::with_capacity(2);
        if !output.text.is_empty() {
            chunks.push(Ok(ModelChunk::Delta(output.text.clone())));
        }
        chunks.push(Ok(ModelChunk::Final(output)));
        Ok(Box::pin(stream::iter(chunks)))
    }
}
