//! 授权层：只消费外部授权决策，不实现策略语言
//!
//! 每个有副作用的步骤（任务提交、每次工具调用）都重新请求决策；
//! 已有决策只在其有效期仍覆盖同一 (principal, action, resource) 时复用。

pub mod http;
pub mod ledger;
pub mod policy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use http::HttpAuthzClient;
pub use ledger::{AuthzGate, DecisionLedger};
pub use policy::StaticPolicy;

pub const ACTION_TASK_SUBMIT: &str = "task.submit";
pub const ACTION_TOOL_INVOKE: &str = "tool.invoke";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzRequest {
    pub principal: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    #[serde(alias = "allowWithConstraints")]
    AllowWithConstraints,
}

/// 授权决策快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzDecision {
    pub principal: String,
    pub action: String,
    pub resource: String,
    pub verdict: Verdict,
    /// 为空表示仅对本次请求有效
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthzDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self.verdict, Verdict::Deny)
    }

    /// 决策是否仍覆盖给定请求
    pub fn covers(&self, request: &AuthzRequest, now: DateTime<Utc>) -> bool {
        self.principal == request.principal
            && self.action == request.action
            && self.resource == request.resource
            && self.valid_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("authorization service unavailable: {0}")]
    Unavailable(String),
    #[error("authorization service returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("authorization response could not be decoded: {0}")]
    Decode(String),
}

/// 授权客户端契约
#[async_trait]
pub trait AuthzClient: Send + Sync {
    async fn check(&self, request: &AuthzRequest) -> Result<AuthzDecision, AuthzError>;
}

/// 规范化 JSON（键排序）后的 SHA-256 十六进制摘要
pub fn digest(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn instruction_resource(instruction: &str) -> String {
    format!(
        "instruction:{}",
        hex::encode(Sha256::digest(instruction.as_bytes()))
    )
}

pub fn tool_resource(tool_name: &str, arguments: &Value) -> String {
    format!("tool:{}#{}", tool_name, digest(arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":2,"a":{"y":1,"x":[1,2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":[1,2],"y":1},"b":2}"#).unwrap();
        assert_eq!(digest(&a), digest(&b));
        assert_ne!(digest(&a), digest(&json!({"b": 3})));
        assert_eq!(digest(&a).len(), 64);
    }

    #[test]
    fn test_tool_resource_scopes_arguments() {
        let r1 = tool_resource("shell", &json!({"cmd": "ls"}));
        let r2 = tool_resource("shell", &json!({"cmd": "rm -rf /"}));
        assert!(r1.starts_with("tool:shell#"));
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_decision_covers_only_same_request_within_window() {
        let now = Utc::now();
        let request = AuthzRequest {
            principal: "alice".into(),
            action: ACTION_TOOL_INVOKE.into(),
            resource: tool_resource("echo", &json!({"text": "a"})),
            context: Value::Null,
        };
        let decision = AuthzDecision {
            principal: "alice".into(),
            action: ACTION_TOOL_INVOKE.into(),
            resource: request.resource.clone(),
            verdict: Verdict::Allow,
            valid_until: Some(now + chrono::Duration::seconds(30)),
            constraints: None,
            reason: None,
        };
        assert!(decision.covers(&request, now));
        assert!(!decision.covers(&request, now + chrono::Duration::seconds(31)));
        let other = AuthzRequest {
            resource: tool_resource("echo", &json!({"text": "b"})),
            ..request.clone()
        };
        assert!(!decision.covers(&other, now));
        let single_use = AuthzDecision {
            valid_until: None,
            ..decision
        };
        assert!(!single_use.covers(&request, now));
    }
}
