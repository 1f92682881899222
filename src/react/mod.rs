//! 认知层：Planner（单次模型调用）、任务主循环、进度事件

pub mod events;
mod loop_;
pub mod planner;

pub use events::KernelEvent;
pub(crate) use loop_::run_task;
pub use planner::{Planner, PlannerEvent};
