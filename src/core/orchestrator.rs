//! 内核编排器：任务表与任务生命周期
//!
//! 每个任务在独立的 tokio 任务中执行 `run_task`，外层 supervise 负责截止时间、
//! 协作取消的宽限期与终态收尾（状态迁移 + 终态审计，恰好一次）。
//! 对外只暴露快照（watch）、进度事件（broadcast）与 Turn 日志副本；任务表的锁从不跨 await 持有。
//! 终态任务在 retention 之后移出任务表。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEmitter, AuditEvent, AuditKind};
use crate::authz::{AuthzGate, DecisionLedger};
use crate::config::KernelLimits;
use crate::core::{
    CancelReason, Disposition, FailureKind, KernelError, RecoveryEngine, Task, TaskId,
    TaskOutcome, TaskRequest, TaskSnapshot, TaskStatus, TaskSupervisor,
};
use crate::llm::TokenUsage;
use crate::memory::{MemoryStore, Turn};
use crate::react::{run_task, KernelEvent, Planner};
use crate::tools::{ToolDispatcher, ToolSpec};

/// 每个任务的事件通道容量；慢订阅者会丢失最早的事件
const EVENT_CAPACITY: usize = 256;

/// 所有任务共享的协作方与限制
pub(crate) struct KernelServices {
    pub planner: Planner,
    pub dispatcher: Arc<ToolDispatcher>,
    pub authz: AuthzGate,
    pub audit: AuditEmitter,
    pub memory: Arc<dyn MemoryStore>,
    pub memory_timeout: Duration,
    pub recovery: RecoveryEngine,
    pub limits: KernelLimits,
}

/// 任务表中的一项：任务本身、监管器、决策账本与对外发布的通道
pub(crate) struct TaskEntry {
    pub task: Task,
    pub supervisor: TaskSupervisor,
    pub ledger: DecisionLedger,
    status_tx: watch::Sender<TaskSnapshot>,
    events: broadcast::Sender<KernelEvent>,
    turns: RwLock<Vec<Turn>>,
    finished: AtomicBool,
}

impl TaskEntry {
    fn new(task: Task, supervisor: TaskSupervisor) -> Self {
        let snapshot = TaskSnapshot {
            task_id: task.id.clone(),
            principal: task.principal.clone(),
            status: TaskStatus::Received,
            outcome: None,
            rounds: 0,
            turn_count: 0,
            usage: TokenUsage::default(),
            created_at: task.created_at,
            deadline: task.deadline,
            audit_fault: false,
        };
        let (status_tx, _) = watch::channel(snapshot);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            task,
            supervisor,
            ledger: DecisionLedger::new(),
            status_tx,
            events,
            turns: RwLock::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// 推进状态；非法迁移被忽略并记 warn
    pub fn set_status(&self, next: TaskStatus) -> bool {
        let mut from = TaskStatus::Received;
        let changed = self.status_tx.send_if_modified(|s| {
            from = s.status;
            if s.status == next || !s.status.can_transition_to(next) {
                return false;
            }
            s.status = next;
            true
        });
        if changed {
            tracing::debug!(from = ?from, to = ?next, "Task status changed");
            self.emit(KernelEvent::StatusChanged { status: next });
        } else if from != next {
            tracing::warn!(from = ?from, to = ?next, "Illegal status transition ignored");
        }
        changed
    }

    /// 把 Turn 复制到对外可见的日志并发布
    pub fn mirror_turn(&self, turn: &Turn) {
        let count = match self.turns.write() {
            Ok(mut turns) => {
                turns.push(turn.clone());
                turns.len()
            }
            Err(_) => return,
        };
        self.status_tx.send_modify(|s| s.turn_count = count);
        self.emit(KernelEvent::TurnAppended { turn: turn.clone() });
    }

    pub fn round_started(&self, round: u32, max_rounds: u32) {
        self.status_tx.send_modify(|s| s.rounds = round);
        self.emit(KernelEvent::RoundStarted { round, max_rounds });
    }

    pub fn add_usage(&self, usage: TokenUsage) {
        self.status_tx.send_modify(|s| s.usage.add(usage));
    }

    pub fn delta(&self, text: &str) {
        self.emit(KernelEvent::ModelDelta {
            text: text.to_string(),
        });
    }

    pub fn emit(&self, event: KernelEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.status_tx.borrow().clone()
    }

    fn turns(&self) -> Vec<Turn> {
        self.turns.read().map(|t| t.clone()).unwrap_or_default()
    }
}

struct KernelInner {
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    services: Arc<KernelServices>,
    shutdown: CancellationToken,
}

/// 内核句柄（可廉价克隆），由 [`crate::core::KernelBuilder`] 构建
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub(crate) fn new(services: KernelServices) -> Self {
        Self {
            inner: Arc::new(KernelInner {
                tasks: RwLock::new(HashMap::new()),
                services: Arc::new(services),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn limits(&self) -> &KernelLimits {
        &self.inner.services.limits
    }

    /// 已注册工具（按名称排序）
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.inner.services.dispatcher.specs()
    }

    /// 创建任务并立即返回 ID；任务在独立的 tokio 任务中执行
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, KernelError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(KernelError::Cancelled("kernel shutdown".into()));
        }
        let principal = request.principal.trim();
        if principal.is_empty() {
            return Err(KernelError::InvalidRequest("principal must not be empty".into()));
        }
        if request.instruction.trim().is_empty() {
            return Err(KernelError::InvalidRequest(
                "instruction must not be empty".into(),
            ));
        }

        let limits = &self.inner.services.limits;
        let created_at = Utc::now();
        let deadline = match request.deadline {
            Some(deadline) if deadline <= created_at => {
                return Err(KernelError::InvalidRequest(format!(
                    "deadline {} is already in the past",
                    deadline.to_rfc3339()
                )));
            }
            Some(deadline) => deadline,
            None => {
                created_at
                    + chrono::Duration::from_std(limits.default_deadline)
                        .map_err(|e| KernelError::Config(e.to_string()))?
            }
        };
        let remaining = (deadline - created_at).to_std().unwrap_or(Duration::ZERO);

        let task = Task {
            id: TaskId::new(),
            principal: principal.to_string(),
            instruction: request.instruction,
            created_at,
            deadline,
        };
        let id = task.id.clone();
        let supervisor = TaskSupervisor::new(
            &self.inner.shutdown,
            Instant::now() + remaining,
            limits.cancel_grace,
        );
        let entry = Arc::new(TaskEntry::new(task, supervisor));

        self.inner
            .tasks
            .write()
            .map_err(|_| KernelError::Internal("task table lock poisoned".into()))?
            .insert(id.clone(), entry.clone());

        tracing::info!(task_id = %id, principal = %entry.task.principal, "Task submitted");
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            self.inner.services.clone(),
            entry,
        ));
        Ok(id)
    }

    fn entry(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.inner.tasks.read().ok()?.get(id).cloned()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.entry(id).map(|e| e.snapshot())
    }

    /// 当前 Turn 日志副本（含历史上下文）
    pub fn turns(&self, id: &TaskId) -> Option<Vec<Turn>> {
        self.entry(id).map(|e| e.turns())
    }

    /// 订阅进度事件；订阅前已发生的事件不会重放
    pub fn subscribe(&self, id: &TaskId) -> Option<broadcast::Receiver<KernelEvent>> {
        self.entry(id).map(|e| e.events.subscribe())
    }

    /// 订阅快照变化
    pub fn watch(&self, id: &TaskId) -> Option<watch::Receiver<TaskSnapshot>> {
        self.entry(id).map(|e| e.status_tx.subscribe())
    }

    /// 请求取消；任务不存在、已终态或已在取消中时返回 false
    pub fn cancel(&self, id: &TaskId) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        if entry.snapshot().is_terminal() {
            return false;
        }
        let first = entry.supervisor.cancel(CancelReason::Requested);
        if first {
            tracing::info!(task_id = %id, "Task cancellation requested");
        }
        first
    }

    /// 等待任务进入终态
    pub async fn wait(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let mut rx = self.watch(id)?;
        let snapshot = rx.wait_for(|s| s.is_terminal()).await.ok()?.clone();
        Some(snapshot)
    }

    /// 取消所有进行中的任务，并拒绝新任务
    pub fn shutdown(&self) {
        tracing::info!("Kernel shutting down, cancelling in-flight tasks");
        self.inner.shutdown.cancel();
    }
}

impl KernelInner {
    fn evict(&self, id: &TaskId) {
        if let Ok(mut tasks) = self.tasks.write() {
            if tasks.remove(id).is_some() {
                tracing::debug!(task_id = %id, "Terminal task evicted");
            }
        }
    }
}

/// 执行任务并守护截止时间；取消后最多等待宽限期，超过则放弃执行体。
/// 收尾后保留 retention，再从任务表移除。
async fn supervise(kernel: Weak<KernelInner>, svc: Arc<KernelServices>, entry: Arc<TaskEntry>) {
    let sup = &entry.supervisor;
    let mut runner = tokio::spawn({
        let svc = svc.clone();
        let entry = entry.clone();
        async move { run_task(&svc, &entry).await }
    });

    let early = tokio::select! {
        biased;
        res = &mut runner => Some(joined(res)),
        _ = sup.token().cancelled() => None,
        _ = tokio::time::sleep_until(sup.deadline()) => {
            tracing::warn!(task_id = %entry.task.id, "Task deadline exceeded");
            sup.cancel(CancelReason::DeadlineExceeded);
            None
        }
    };

    let result = match early {
        Some(result) => result,
        None => match tokio::time::timeout(sup.grace(), &mut runner).await {
            Ok(res) => joined(res),
            Err(_) => {
                tracing::warn!(
                    task_id = %entry.task.id,
                    grace_ms = sup.grace().as_millis() as u64,
                    "Task did not stop within grace period, abandoning"
                );
                runner.abort();
                Err(sup.cancel_error())
            }
        },
    };

    finish(&svc, &entry, result).await;

    let id = entry.task.id.clone();
    drop(entry);
    tokio::time::sleep(svc.limits.retention).await;
    if let Some(inner) = kernel.upgrade() {
        inner.evict(&id);
    }
}

fn joined(res: Result<Result<TaskOutcome, KernelError>, JoinError>) -> Result<TaskOutcome, KernelError> {
    res.unwrap_or_else(|e| Err(KernelError::Internal(format!("task runner aborted: {}", e))))
}

/// 终态收尾：迁移状态、写终态审计、发布 Finished（每个任务恰好一次）
async fn finish(svc: &KernelServices, entry: &TaskEntry, result: Result<TaskOutcome, KernelError>) {
    if entry.finished.swap(true, Ordering::SeqCst) {
        return;
    }
    let task_id = &entry.task.id;

    let (outcome, terminal_audit) = match result {
        Ok(outcome) => (outcome, None),
        Err(err) => {
            // 取消后的错误都是取消的结果
            let err = if entry.supervisor.is_cancelled() {
                entry.supervisor.cancel_error()
            } else {
                err
            };
            let detail = err.to_string();
            let outcome = match svc.recovery.disposition(&err) {
                Disposition::Cancel(kind) => TaskOutcome::Cancelled { kind, detail },
                Disposition::Fail(kind) => TaskOutcome::Failed { kind, detail },
                Disposition::Absorb | Disposition::Retry => TaskOutcome::Failed {
                    kind: err.kind(),
                    detail,
                },
            };
            let audit_kind = match &outcome {
                TaskOutcome::Failed {
                    kind: FailureKind::AuthzDenied,
                    ..
                } => AuditKind::TaskRejected,
                TaskOutcome::Cancelled { .. } => AuditKind::TaskCancelled,
                _ => AuditKind::TaskFailed,
            };
            (outcome, Some(audit_kind))
        }
    };

    let mut audit_fault = false;
    if let Some(kind) = terminal_audit {
        let (failure, detail) = match &outcome {
            TaskOutcome::Failed { kind, detail } | TaskOutcome::Cancelled { kind, detail } => {
                (Some(*kind), detail.as_str())
            }
            TaskOutcome::Completed { .. } => (None, ""),
        };
        let event = AuditEvent::task(
            task_id,
            kind,
            json!({
                "failureKind": failure,
                "detail": detail,
                "rounds": entry.snapshot().rounds,
            }),
        );
        if let Err(e) = svc.audit.emit(event).await {
            tracing::error!(task_id = %task_id, kind = ?kind, error = %e, "Terminal audit event lost");
            audit_fault = true;
        }
    }

    let status = match &outcome {
        TaskOutcome::Completed { .. } => TaskStatus::Completed,
        TaskOutcome::Failed { .. } => TaskStatus::Failed,
        TaskOutcome::Cancelled { .. } => TaskStatus::Cancelled,
    };
    match &outcome {
        TaskOutcome::Completed { flag, .. } => {
            tracing::info!(task_id = %task_id, flag = ?flag, "Task completed")
        }
        TaskOutcome::Failed { kind, detail } => {
            tracing::warn!(task_id = %task_id, kind = ?kind, detail = %detail, "Task failed")
        }
        TaskOutcome::Cancelled { kind, detail } => {
            tracing::info!(task_id = %task_id, kind = ?kind, detail = %detail, "Task cancelled")
        }
    }

    entry.status_tx.send_modify(|s| {
        s.status = status;
        s.outcome = Some(outcome);
        s.audit_fault = audit_fault;
    });
    entry.emit(KernelEvent::StatusChanged { status });
    entry.emit(KernelEvent::Finished {
        snapshot: entry.snapshot(),
    });
}
