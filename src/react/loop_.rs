//! 任务主循环
//!
//! AUTHORIZING -> CONTEXT_READY -> MODEL_INVOKED -> {TOOL_PENDING <-> MODEL_INVOKED} -> FINALIZING。
//! 模型调用与工具派发是显式的顺序步骤；每个挂起点都经 TaskSupervisor::guard 观察取消。
//! 同一轮的工具调用并发执行（受 TaskScheduler 限制），结果按模型发出的顺序写回 Turn 日志。

use futures_util::future::try_join_all;
use serde_json::json;
use tracing::Instrument;

use crate::audit::{AuditEvent, AuditKind};
use crate::authz::{
    instruction_resource, tool_resource, AuthzRequest, ACTION_TASK_SUBMIT, ACTION_TOOL_INVOKE,
};
use crate::core::orchestrator::{KernelServices, TaskEntry};
use crate::core::{
    CompletionFlag, Disposition, KernelError, TaskOutcome, TaskScheduler, TaskStatus,
};
use crate::memory::{ToolCall, ToolErrorKind, ToolResult, Turn, TurnLog};
use crate::react::{KernelEvent, PlannerEvent};

/// 回复预览最大字符数（审计载荷）
const ANSWER_PREVIEW_CHARS: usize = 200;

/// 执行一个任务直到 FINALIZING 完成；终态迁移与终态审计由调用方负责
pub(crate) async fn run_task(
    svc: &KernelServices,
    entry: &TaskEntry,
) -> Result<TaskOutcome, KernelError> {
    let span = tracing::info_span!(
        "task",
        task_id = %entry.task.id,
        principal = %entry.task.principal
    );
    run_task_inner(svc, entry).instrument(span).await
}

async fn run_task_inner(
    svc: &KernelServices,
    entry: &TaskEntry,
) -> Result<TaskOutcome, KernelError> {
    let task = &entry.task;
    let sup = &entry.supervisor;

    // 1. 授权
    entry.set_status(TaskStatus::Authorizing);
    let request = AuthzRequest {
        principal: task.principal.clone(),
        action: ACTION_TASK_SUBMIT.to_string(),
        resource: instruction_resource(&task.instruction),
        context: json!({ "taskId": task.id }),
    };
    let decision = sup
        .guard(svc.authz.check(&entry.ledger, &request))
        .await?
        .map_err(|e| KernelError::AuthzUnavailable(e.to_string()))?;
    if !decision.is_allowed() {
        tracing::info!("Task rejected by authorization");
        return Err(KernelError::AuthzDenied(
            decision
                .reason
                .unwrap_or_else(|| "instruction denied by policy".to_string()),
        ));
    }
    audit(
        svc,
        entry,
        AuditEvent::task(
            &task.id,
            AuditKind::TaskAuthorized,
            json!({ "verdict": decision.verdict, "constraints": decision.constraints }),
        ),
    )
    .await?;

    // 2. 组装上下文（失败降级为空上下文）
    let mut log = TurnLog::new();
    let fetched = sup
        .guard(tokio::time::timeout(svc.memory_timeout, svc.memory.fetch(&task.id)))
        .await?;
    let history = match fetched {
        Ok(Ok(turns)) => Ok(turns),
        Ok(Err(e)) => Err(KernelError::MemoryUnavailable(e.to_string())),
        Err(_) => Err(KernelError::MemoryUnavailable(format!(
            "no response within {} ms",
            svc.memory_timeout.as_millis()
        ))),
    };
    let degraded = match history {
        Ok(turns) => {
            log.seed(turns);
            false
        }
        Err(err) => match svc.recovery.disposition(&err) {
            Disposition::Absorb => {
                tracing::warn!(error = %err, "Memory fetch failed, continuing with empty context");
                true
            }
            _ => return Err(err),
        },
    };
    for turn in log.turns() {
        entry.mirror_turn(turn);
    }
    entry.set_status(TaskStatus::ContextReady);
    audit(
        svc,
        entry,
        AuditEvent::task(
            &task.id,
            AuditKind::ContextAssembled,
            json!({ "historyTurns": log.context_len(), "degraded": degraded }),
        ),
    )
    .await?;

    let user_turn = log.push_user(task.instruction.clone()).clone();
    record_turn(svc, entry, &user_turn).await;

    // 3. 轮次循环
    let max_rounds = svc.limits.max_rounds;
    let tools = svc.dispatcher.specs();
    let mut round = 0;
    let (answer, flag) = loop {
        round += 1;
        entry.round_started(round, max_rounds);
        entry.set_status(TaskStatus::ModelInvoked);

        let output = svc
            .planner
            .invoke(log.turns(), tools.clone(), sup, &|event| match event {
                PlannerEvent::Delta(text) => entry.delta(text),
                PlannerEvent::Retrying {
                    failed_attempt,
                    delay,
                } => entry.emit(KernelEvent::ModelRetry {
                    failed_attempt,
                    delay_ms: delay.as_millis() as u64,
                }),
            })
            .instrument(tracing::info_span!("round", round))
            .await?;
        entry.add_usage(output.usage);

        let stop_reason = output.stop_reason;
        let model_turn = log.push_model(output.text, output.tool_calls).clone();
        record_turn(svc, entry, &model_turn).await;
        audit(
            svc,
            entry,
            AuditEvent::task(
                &task.id,
                AuditKind::ModelInvoked,
                json!({
                    "round": round,
                    "provider": svc.planner.provider_name(),
                    "stopReason": stop_reason,
                    "toolCalls": model_turn.tool_calls().len(),
                    "usage": output.usage,
                }),
            ),
        )
        .await?;

        let calls = model_turn.tool_calls().to_vec();
        let text = model_turn.text().unwrap_or_default().to_string();
        if calls.is_empty() {
            break (text, None);
        }
        if round >= max_rounds {
            tracing::warn!(round, "Round limit reached, finalizing with last model output");
            for call in &calls {
                let skipped = ToolResult::failure(
                    call,
                    ToolErrorKind::Skipped,
                    "round limit reached, call not dispatched",
                    0,
                );
                accept_result(svc, entry, &mut log, skipped).await?;
            }
            break (text, Some(CompletionFlag::TruncatedByRoundLimit));
        }

        entry.set_status(TaskStatus::ToolPending);
        let results = execute_round(svc, entry, &calls).await?;
        for result in results {
            accept_result(svc, entry, &mut log, result).await?;
        }
    };

    // 4. 收尾：终态审计写入后才算完成
    entry.set_status(TaskStatus::Finalizing);
    let snapshot = entry.snapshot();
    audit(
        svc,
        entry,
        AuditEvent::task(
            &task.id,
            AuditKind::TaskCompleted,
            json!({
                "rounds": snapshot.rounds,
                "turns": log.len(),
                "flag": flag,
                "usage": snapshot.usage,
                "answerPreview": answer.chars().take(ANSWER_PREVIEW_CHARS).collect::<String>(),
            }),
        ),
    )
    .await?;

    Ok(TaskOutcome::Completed { answer, flag })
}

/// 并发执行一轮工具调用；返回顺序与 calls 一致
async fn execute_round(
    svc: &KernelServices,
    entry: &TaskEntry,
    calls: &[ToolCall],
) -> Result<Vec<ToolResult>, KernelError> {
    let scheduler = TaskScheduler::new(svc.limits.max_parallel_tool_calls);
    let runs = calls.iter().map(|call| {
        let scheduler = &scheduler;
        async move {
            let _permit = entry.supervisor.guard(scheduler.acquire_tool()).await??;
            run_call(svc, entry, call).await
        }
    });
    try_join_all(runs).await
}

/// 单个工具调用：未知工具直接失败；否则按 (principal, 工具, 参数摘要) 重新授权后派发
async fn run_call(
    svc: &KernelServices,
    entry: &TaskEntry,
    call: &ToolCall,
) -> Result<ToolResult, KernelError> {
    let task = &entry.task;
    if !svc.dispatcher.knows(&call.name) {
        return Ok(svc.dispatcher.unknown(call));
    }

    let request = AuthzRequest {
        principal: task.principal.clone(),
        action: ACTION_TOOL_INVOKE.to_string(),
        resource: tool_resource(&call.name, &call.arguments),
        context: json!({ "taskId": task.id, "correlationId": call.correlation_id }),
    };
    let decision = entry
        .supervisor
        .guard(svc.authz.check(&entry.ledger, &request))
        .await?
        .map_err(|e| KernelError::AuthzUnavailable(e.to_string()))?;

    if !decision.is_allowed() {
        let reason = decision
            .reason
            .unwrap_or_else(|| format!("tool {} denied by policy", call.name));
        audit(
            svc,
            entry,
            AuditEvent::call(
                &task.id,
                &call.correlation_id,
                AuditKind::ToolCallDenied,
                json!({ "tool": call.name, "resource": request.resource, "reason": reason }),
            ),
        )
        .await?;
        return Ok(svc.dispatcher.denied(call, &reason));
    }

    audit(
        svc,
        entry,
        AuditEvent::call(
            &task.id,
            &call.correlation_id,
            AuditKind::ToolCallAuthorized,
            json!({
                "tool": call.name,
                "resource": request.resource,
                "verdict": decision.verdict,
                "constraints": decision.constraints,
            }),
        ),
    )
    .await?;

    entry.emit(KernelEvent::ToolDispatched {
        correlation_id: call.correlation_id.clone(),
        tool: call.name.clone(),
    });
    let result = svc
        .dispatcher
        .dispatch(call, Some(task.deadline), entry.supervisor.token())
        .await;
    if result.error_kind() == Some(ToolErrorKind::Cancelled) && entry.supervisor.is_cancelled() {
        return Err(entry.supervisor.cancel_error());
    }
    entry.emit(KernelEvent::ToolFinished {
        correlation_id: call.correlation_id.clone(),
        tool: call.name.clone(),
        ok: result.is_success(),
        duration_ms: result.duration_ms,
    });
    Ok(result)
}

/// 把工具结果写入 Turn 日志；重复或未知的 correlation id 记日志后丢弃
async fn accept_result(
    svc: &KernelServices,
    entry: &TaskEntry,
    log: &mut TurnLog,
    result: ToolResult,
) -> Result<(), KernelError> {
    let correlation_id = result.correlation_id.clone();
    let payload = json!({
        "tool": result.tool_name,
        "ok": result.is_success(),
        "errorKind": result.error_kind(),
        "durationMs": result.duration_ms,
    });
    let turn = match log.accept_result(result) {
        Ok(turn) => turn.clone(),
        Err(e) => {
            tracing::warn!(correlation_id = %correlation_id, error = %e, "Tool result discarded");
            return Ok(());
        }
    };
    record_turn(svc, entry, &turn).await;
    audit(
        svc,
        entry,
        AuditEvent::call(
            &entry.task.id,
            &correlation_id,
            AuditKind::ToolResultRecorded,
            payload,
        ),
    )
    .await
}

/// 发布 Turn 并追加到记忆库；追加失败只记 warn
async fn record_turn(svc: &KernelServices, entry: &TaskEntry, turn: &Turn) {
    entry.mirror_turn(turn);
    match tokio::time::timeout(svc.memory_timeout, svc.memory.append(&entry.task.id, turn)).await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(seq = turn.seq, error = %e, "Memory append failed"),
        Err(_) => tracing::warn!(seq = turn.seq, "Memory append timed out"),
    }
}

async fn audit(
    svc: &KernelServices,
    entry: &TaskEntry,
    event: AuditEvent,
) -> Result<(), KernelError> {
    entry
        .supervisor
        .guard(svc.audit.emit(event))
        .await?
        .map_err(|e| KernelError::AuditUnavailable(e.to_string()))
}
