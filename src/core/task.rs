//! 任务：标识、创建请求、终态结果

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::FailureKind;

/// 任务 ID（创建后不可变）
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 任务创建请求：`{principal, instruction, deadline?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub principal: String,
    pub instruction: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(principal: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            instruction: instruction.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub principal: String,
    pub instruction: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionFlag {
    /// 轮次用尽，以最后一次模型输出强制收尾
    TruncatedByRoundLimit,
}

/// 任务终态结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        answer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flag: Option<CompletionFlag>,
    },
    Failed {
        kind: FailureKind,
        detail: String,
    },
    Cancelled {
        kind: FailureKind,
        detail: String,
    },
}

impl TaskOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed { answer, .. } => Some(answer),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed { kind, .. } | TaskOutcome::Cancelled { kind, .. } => Some(*kind),
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Completed {
                flag: Some(CompletionFlag::TruncatedByRoundLimit),
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_round_trips_through_string() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TaskOutcome::Completed {
            answer: "42".into(),
            flag: Some(CompletionFlag::TruncatedByRoundLimit),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["result"], "completed");
        assert_eq!(value["flag"], "truncated_by_round_limit");
        assert!(outcome.is_truncated());

        let failed = TaskOutcome::Failed {
            kind: FailureKind::AuditUnavailable,
            detail: "sink down".into(),
        };
        assert_eq!(failed.failure_kind(), Some(FailureKind::AuditUnavailable));
        assert_eq!(serde_json::to_value(&failed).unwrap()["kind"], "audit_unavailable");
    }

    #[test]
    fn test_request_deadline_is_optional() {
        let req: TaskRequest =
            serde_json::from_str(r#"{"principal":"alice","instruction":"hi"}"#).unwrap();
        assert!(req.deadline.is_none());
    }
}
