//! 审计层：只追加的事件流
//!
//! 审计丢失视为正确性故障：AuditEmitter 有界重试后仍失败时返回错误，由内核把任务转入 FAILED。

pub mod emitter;
pub mod sinks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::TaskId;

pub use emitter::AuditEmitter;
pub use sinks::{HttpAuditSink, MemoryAuditSink, TracingAuditSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    TaskRejected,
    TaskAuthorized,
    ContextAssembled,
    ModelInvoked,
    ToolCallAuthorized,
    ToolCallDenied,
    ToolResultRecorded,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

/// 审计事件（线上格式：`{taskId, correlationId?, kind, timestamp, payload}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl AuditEvent {
    pub fn task(task_id: &TaskId, kind: AuditKind, payload: Value) -> Self {
        Self {
            task_id: task_id.clone(),
            correlation_id: None,
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn call(task_id: &TaskId, correlation_id: &str, kind: AuditKind, payload: Value) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            ..Self::task(task_id, kind, payload)
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink transport error: {0}")]
    Transport(String),
    #[error("audit sink returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("audit write timed out after {0} ms")]
    Timeout(u64),
    #[error("audit write failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// 审计写入契约：返回 Ok 即视为已确认
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError>;
}
