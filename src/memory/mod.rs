//! 记忆层：Turn 数据模型与任务日志、记忆库客户端

pub mod store;
pub mod turn;

pub use store::{HttpMemoryStore, InMemoryStore, MemoryError, MemoryStore};
pub use turn::{
    new_correlation_id, Role, ToolCall, ToolErrorKind, ToolOutcome, ToolResult, Turn, TurnContent,
    TurnLog, TurnLogError,
};
