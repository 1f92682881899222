//! 工具注册表
//!
//! 所有工具适配器实现 ToolAdapter trait（name / description / parameters_schema / invoke），
//! 由 ToolRegistry 按名注册与查找；ToolDispatcher 在调用时做参数校验、超时与审计日志。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::schema::ArgumentSchema;

/// 通告给模型的工具声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 发给适配器的调用请求（线上格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
    pub correlation_id: String,
    pub deadline: Option<DateTime<Utc>>,
}

/// 适配器响应（线上格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    pub success: bool,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl AdapterResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            duration_ms: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            duration_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter transport error: {0}")]
    Transport(String),
    #[error("adapter returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("adapter response could not be decoded: {0}")]
    Decode(String),
}

/// 工具适配器 trait：每个适配器按名独立注册，须能承受至少一次投递
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；调用前按它校验参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<AdapterResponse, AdapterError>;
}

#[derive(Debug, Error)]
#[error("tool {tool}: invalid parameters schema: {reason}")]
pub struct SchemaError {
    pub tool: String,
    pub reason: String,
}

/// 注册表中的一项：适配器与编译好的参数校验器
#[derive(Clone)]
pub struct RegisteredTool {
    pub adapter: Arc<dyn ToolAdapter>,
    pub schema: Arc<ArgumentSchema>,
}

/// 工具注册表：按名称存储适配器，注册时编译参数 schema
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: impl ToolAdapter + 'static) -> Result<(), SchemaError> {
        self.register_arc(Arc::new(adapter))
    }

    /// schema 编译失败时不注册，原有同名工具保持不变
    pub fn register_arc(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<(), SchemaError> {
        let name = adapter.name().to_string();
        let schema = ArgumentSchema::compile(&adapter.parameters_schema()).map_err(|reason| {
            SchemaError {
                tool: name.clone(),
                reason,
            }
        })?;
        let tool = RegisteredTool {
            adapter,
            schema: Arc::new(schema),
        };
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool adapter re-registered, previous one replaced");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称排序的工具声明，保证每次给模型的工具列表一致
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.adapter.name().to_string(),
                description: tool.adapter.description().to_string(),
                input_schema: tool.adapter.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, NoopTool};

    #[test]
    fn test_specs_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(NoopTool).unwrap();
        registry.register(EchoTool).unwrap();
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "noop"]);
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
    }

    struct BadSchema;

    #[async_trait]
    impl ToolAdapter for BadSchema {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "schema is not a schema"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": 42 })
        }

        async fn invoke(&self, _inv: ToolInvocation) -> Result<AdapterResponse, AdapterError> {
            Ok(AdapterResponse::ok(Value::Null))
        }
    }

    #[test]
    fn test_uncompilable_schema_is_not_registered() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let err = registry.register(BadSchema).unwrap_err();
        assert_eq!(err.tool, "echo");
        let kept = registry.get("echo").unwrap();
        assert_eq!(kept.adapter.description(), EchoTool.description());
    }

    #[test]
    fn test_adapter_response_wire_format() {
        let parsed: AdapterResponse =
            serde_json::from_str(r#"{"success":false,"error":"boom","durationMs":12}"#).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("boom"));
        assert_eq!(parsed.duration_ms, Some(12));
    }
}
