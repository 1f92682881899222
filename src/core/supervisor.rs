//! 任务监管：取消令牌、截止时间、宽限期
//!
//! 每个任务一个 TaskSupervisor。取消原因只记录第一次；执行体在每个挂起点通过 `guard` 观察取消。

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    DeadlineExceeded,
    Shutdown,
}

#[derive(Debug)]
pub struct TaskSupervisor {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    deadline: Instant,
    grace: Duration,
}

impl TaskSupervisor {
    pub fn new(parent: &CancellationToken, deadline: Instant, grace: Duration) -> Self {
        Self {
            token: parent.child_token(),
            reason: OnceLock::new(),
            deadline,
            grace,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// 触发取消；返回 false 表示之前已取消
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.reason.get() {
            Some(reason) => Some(*reason),
            // 父令牌（内核关闭）触发时没有记录原因
            None if self.token.is_cancelled() => Some(CancelReason::Shutdown),
            None => None,
        }
    }

    /// 与取消原因对应的错误
    pub fn cancel_error(&self) -> KernelError {
        match self.reason() {
            Some(CancelReason::DeadlineExceeded) => KernelError::DeadlineExceeded,
            Some(CancelReason::Shutdown) => KernelError::Cancelled("kernel shutdown".into()),
            Some(CancelReason::Requested) | None => {
                KernelError::Cancelled("cancelled by request".into())
            }
        }
    }

    /// 在取消令牌保护下等待一个挂起点
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, KernelError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.cancel_error()),
            out = fut => Ok(out),
        }
    }
}
