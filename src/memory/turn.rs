//! Turn 日志：任务内唯一的「发生了什么」事实来源
//!
//! Turn 只追加、不修改；序号在任务内单调递增。ToolResult 按 correlation id 挂接到发起它的
//! ToolCall，每个 ToolCall 至多接受一个结果，迟到或重复的结果被拒绝。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Turn 角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// 模型请求的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub correlation_id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(correlation_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 工具失败的细分类型（回灌给模型，不终止任务）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    AuthzDenied,
    Timeout,
    ExecutionError,
    Cancelled,
    /// 轮次上限已到，调用未被派发
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: Value },
    Failure { kind: ToolErrorKind, detail: String },
}

/// 工具调用结果；每个 correlation id 只写入一次
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub correlation_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, payload: Value, duration_ms: u64) -> Self {
        Self {
            correlation_id: call.correlation_id.clone(),
            tool_name: call.name.clone(),
            outcome: ToolOutcome::Success { payload },
            duration_ms,
        }
    }

    pub fn failure(
        call: &ToolCall,
        kind: ToolErrorKind,
        detail: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            correlation_id: call.correlation_id.clone(),
            tool_name: call.name.clone(),
            outcome: ToolOutcome::Failure {
                kind,
                detail: detail.into(),
            },
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// 给模型看的文本形式
    pub fn render(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { payload } => payload.to_string(),
            ToolOutcome::Failure { kind, detail } => {
                serde_json::json!({ "error": kind, "detail": detail }).to_string()
            }
        }
    }
}

/// Turn 内容：纯文本、模型输出（可带 ToolCall）、工具结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text {
        text: String,
    },
    ModelOutput {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        result: ToolResult,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub seq: u64,
    pub role: Role,
    pub content: TurnContent,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.content {
            TurnContent::ModelOutput { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } | TurnContent::ModelOutput { text, .. } => Some(text),
            TurnContent::ToolResult { .. } => None,
        }
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            TurnContent::ToolResult { result } => Some(result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnLogError {
    #[error("no pending tool call with correlation id {0}")]
    UnknownCorrelation(String),
    #[error("tool call {0} already resolved")]
    AlreadyResolved(String),
}

/// 单个任务独占的 Turn 日志
#[derive(Debug, Default)]
pub struct TurnLog {
    turns: Vec<Turn>,
    next_seq: u64,
    pending: Vec<String>,
    resolved: HashSet<String>,
    /// 从记忆库载入的前缀条数（不再回写）
    context_len: usize,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 载入历史上下文；重新编号以保证本地序号严格递增，历史中的 ToolCall 不计入待决
    pub fn seed(&mut self, history: Vec<Turn>) {
        for mut turn in history {
            for call in turn.tool_calls() {
                self.resolved.insert(call.correlation_id.clone());
            }
            if let Some(result) = turn.tool_result() {
                self.resolved.insert(result.correlation_id.clone());
            }
            turn.seq = self.bump();
            self.turns.push(turn);
        }
        self.context_len = self.turns.len();
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> &Turn {
        self.push(Role::User, TurnContent::Text { text: text.into() })
    }

    /// 追加模型输出；缺失或重复的 correlation id 会被替换为新生成的 id
    pub fn push_model(&mut self, text: impl Into<String>, tool_calls: Vec<ToolCall>) -> &Turn {
        let mut seen = HashSet::new();
        let tool_calls = tool_calls
            .into_iter()
            .map(|mut call| {
                if call.correlation_id.is_empty()
                    || self.knows(&call.correlation_id)
                    || !seen.insert(call.correlation_id.clone())
                {
                    call.correlation_id = new_correlation_id();
                    seen.insert(call.correlation_id.clone());
                }
                call
            })
            .collect::<Vec<_>>();
        self.pending
            .extend(tool_calls.iter().map(|c| c.correlation_id.clone()));
        self.push(
            Role::Model,
            TurnContent::ModelOutput {
                text: text.into(),
                tool_calls,
            },
        )
    }

    /// 接受工具结果：只有待决的 correlation id 能写入，且只写一次
    pub fn accept_result(&mut self, result: ToolResult) -> Result<&Turn, TurnLogError> {
        let id = result.correlation_id.clone();
        if self.resolved.contains(&id) {
            return Err(TurnLogError::AlreadyResolved(id));
        }
        let Some(pos) = self.pending.iter().position(|p| p == &id) else {
            return Err(TurnLogError::UnknownCorrelation(id));
        };
        self.pending.remove(pos);
        self.resolved.insert(id);
        Ok(self.push(Role::Tool, TurnContent::ToolResult { result }))
    }

    fn knows(&self, correlation_id: &str) -> bool {
        self.resolved.contains(correlation_id) || self.pending.iter().any(|p| p == correlation_id)
    }

    fn push(&mut self, role: Role, content: TurnContent) -> &Turn {
        let seq = self.bump();
        self.turns.push(Turn {
            seq,
            role,
            content,
            created_at: Utc::now(),
        });
        &self.turns[self.turns.len() - 1]
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn context_len(&self) -> usize {
        self.context_len
    }

    /// 尚未得到结果的 correlation id（按发出顺序）
    pub fn pending(&self) -> &[String] {
        &self.pending
    }
}

pub fn new_correlation_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
