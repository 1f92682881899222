//! 任务进度事件：用于流式/SSE 展示状态变化、模型增量文本、工具调用与终态

use serde::Serialize;

use crate::core::{TaskSnapshot, TaskStatus};
use crate::memory::Turn;

/// 单个任务的进度事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    StatusChanged { status: TaskStatus },
    /// 第几轮（从 1 开始）
    RoundStarted { round: u32, max_rounds: u32 },
    /// 模型流式输出的一小段
    ModelDelta { text: String },
    /// 模型调用将重试；本轮此前的 ModelDelta 作废
    ModelRetry { failed_attempt: u32, delay_ms: u64 },
    TurnAppended { turn: Turn },
    ToolDispatched {
        correlation_id: String,
        tool: String,
    },
    ToolFinished {
        correlation_id: String,
        tool: String,
        ok: bool,
        duration_ms: u64,
    },
    /// 终态（最后一个事件）
    Finished { snapshot: TaskSnapshot },
}

impl KernelEvent {
    /// SSE 的 event 名
    pub fn name(&self) -> &'static str {
        match self {
            KernelEvent::StatusChanged { .. } => "status_changed",
            KernelEvent::RoundStarted { .. } => "round_started",
            KernelEvent::ModelDelta { .. } => "model_delta",
            KernelEvent::ModelRetry { .. } => "model_retry",
            KernelEvent::TurnAppended { .. } => "turn_appended",
            KernelEvent::ToolDispatched { .. } => "tool_dispatched",
            KernelEvent::ToolFinished { .. } => "tool_finished",
            KernelEvent::Finished { .. } => "finished",
        }
    }
}
