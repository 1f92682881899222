//! 工具并发调度：每任务一个 Semaphore 限制单轮工具调用的并发数

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::KernelError;

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 工具并发限制（至少为 1）
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, KernelError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KernelError::Internal("tool semaphore closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_permits_are_bounded() {
        let scheduler = TaskScheduler::new(2);
        let a = scheduler.acquire_tool().await.unwrap();
        let _b = scheduler.acquire_tool().await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(10), scheduler.acquire_tool()).await;
        assert!(third.is_err());
        drop(a);
        assert!(scheduler.acquire_tool().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_is_clamped() {
        let scheduler = TaskScheduler::new(0);
        let _only = scheduler.acquire_tool().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(10), scheduler.acquire_tool()).await;
        assert!(second.is_err());
    }
}
