//! 核心编排层：任务模型、状态机、错误与恢复、重试、监管、调度与内核本身

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod task_scheduler;

pub use builder::KernelBuilder;
pub use error::{FailureKind, KernelError};
pub use orchestrator::Kernel;
pub use recovery::{Disposition, RecoveryEngine};
pub use retry::RetryPolicy;
pub use state::{TaskSnapshot, TaskStatus};
pub use supervisor::{CancelReason, TaskSupervisor};
pub use task::{CompletionFlag, Task, TaskId, TaskOutcome, TaskRequest};
pub use task_scheduler::TaskScheduler;
