//! 任务状态机与快照投影
//!
//! 内部状态由任务自己的执行体推进；外部只看到 TaskSnapshot（经 watch 通道发布）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{TaskId, TaskOutcome};
use crate::llm::TokenUsage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Received,
    Authorizing,
    ContextReady,
    ModelInvoked,
    ToolPending,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 合法迁移；FAILED / CANCELLED 可从任一非终态进入
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Received, Authorizing)
                | (Authorizing, ContextReady)
                | (ContextReady, ModelInvoked)
                | (ModelInvoked, ToolPending)
                | (ToolPending, ModelInvoked)
                | (ModelInvoked, Finalizing)
                | (Finalizing, Completed)
        )
    }
}

/// 对外发布的任务快照
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub principal: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    pub rounds: u32,
    pub turn_count: usize,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// 终态审计事件未能写入
    pub audit_fault: bool,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
