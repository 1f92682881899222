//! Agent Kernel - 智能体请求内核
//!
//! 模块划分：
//! - **audit**: 审计事件、审计汇（HTTP / 内存 / 日志）与带重试的发射器
//! - **authz**: 授权客户端契约、HTTP 客户端、静态策略、每任务决策账本
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、状态机、错误与恢复、监管、调度、内核本身
//! - **llm**: LLM 后端抽象与实现（OpenAI 兼容 / Bedrock / Mock）
//! - **memory**: Turn 数据模型、Turn 日志与记忆库
//! - **observability**: 日志初始化
//! - **react**: Planner 与任务主循环
//! - **tools**: 工具注册表、参数校验、派发器与适配器

pub mod audit;
pub mod authz;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{Kernel, KernelBuilder, KernelError, TaskId, TaskOutcome, TaskRequest};
