//! 进程内工具：echo / noop（本地运行与测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::schema::schema_of;
use crate::tools::{AdapterError, AdapterResponse, ToolAdapter, ToolInvocation};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl ToolAdapter for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back unchanged. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<AdapterResponse, AdapterError> {
        let args: EchoArgs = match serde_json::from_value(invocation.arguments) {
            Ok(args) => args,
            Err(e) => return Ok(AdapterResponse::failed(e.to_string())),
        };
        Ok(AdapterResponse::ok(json!({ "text": args.text })))
    }
}

/// Noop 工具：不做任何事，立即成功
pub struct NoopTool;

#[async_trait]
impl ToolAdapter for NoopTool {
    fn name(&self) -> &str {
        "noop"
    }

    fn description(&self) -> &str {
        "Do nothing and report success"
    }

    async fn invoke(&self, _invocation: ToolInvocation) -> Result<AdapterResponse, AdapterError> {
        Ok(AdapterResponse::ok(json!({ "ok": true })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_text() {
        let response = EchoTool
            .invoke(ToolInvocation {
                tool_name: "echo".into(),
                arguments: json!({"text": "hi"}),
                correlation_id: "c1".into(),
                deadline: None,
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.payload, Some(json!({"text": "hi"})));
    }
}
