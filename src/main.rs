//! Agent Kernel 命令行入口
//!
//! 运行一个任务：进度（模型增量、工具调用）输出到 stderr，最终回复输出到 stdout。
//! Ctrl+C 取消任务；任务 FAILED / CANCELLED 时以非零码退出。

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;

use agent_kernel::config::load_config;
use agent_kernel::core::{KernelBuilder, TaskOutcome, TaskRequest};
use agent_kernel::observability;
use agent_kernel::react::KernelEvent;

#[derive(Parser, Debug)]
#[command(name = "agent-kernel", about = "Run one agent task to completion")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 发起任务的身份
    #[arg(long, default_value = "cli")]
    principal: String,

    /// 任务截止时间（毫秒，从现在起算）
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// 任务指令
    #[arg(required = true)]
    instruction: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;
    let kernel = KernelBuilder::from_config(&cfg)
        .context("Failed to build kernel")?
        .build();

    let mut request = TaskRequest::new(cli.principal, cli.instruction.join(" "));
    if let Some(ms) = cli.deadline_ms {
        let ms = i64::try_from(ms).context("deadline too large")?;
        request = request.with_deadline(chrono::Utc::now() + chrono::Duration::milliseconds(ms));
    }
    let id = kernel.submit(request).context("Task submission rejected")?;
    let events = kernel.subscribe(&id).context("Task disappeared")?;
    let printer = tokio::spawn(print_progress(events));

    let finished = tokio::select! {
        snapshot = kernel.wait(&id) => snapshot,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[cancelling]");
            kernel.cancel(&id);
            kernel.wait(&id).await
        }
    };
    let snapshot = finished.context("Task disappeared")?;
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    eprintln!(
        "\n[task {} {:?} after {} round(s), {} tokens]",
        snapshot.task_id,
        snapshot.status,
        snapshot.rounds,
        snapshot.usage.total()
    );
    if snapshot.audit_fault {
        eprintln!("[warning: terminal audit event was not recorded]");
    }

    match snapshot.outcome {
        Some(TaskOutcome::Completed { answer, flag }) => {
            if flag.is_some() {
                eprintln!("[round limit reached, answer may be incomplete]");
            }
            println!("{}", answer);
            Ok(())
        }
        Some(TaskOutcome::Failed { kind, detail }) => {
            anyhow::bail!("task failed ({:?}): {}", kind, detail)
        }
        Some(TaskOutcome::Cancelled { kind, detail }) => {
            anyhow::bail!("task cancelled ({:?}): {}", kind, detail)
        }
        None => anyhow::bail!("task ended without an outcome"),
    }
}

async fn print_progress(mut events: broadcast::Receiver<KernelEvent>) {
    loop {
        match events.recv().await {
            Ok(KernelEvent::ModelDelta { text }) => {
                eprint!("{}", text);
                let _ = std::io::stderr().flush();
            }
            Ok(KernelEvent::ModelRetry {
                failed_attempt,
                delay_ms,
            }) => {
                eprintln!(
                    "\n[model attempt {} failed, retrying in {} ms; text above is discarded]",
                    failed_attempt, delay_ms
                );
            }
            Ok(KernelEvent::RoundStarted { round, max_rounds }) => {
                eprintln!("\n[round {}/{}]", round, max_rounds);
            }
            Ok(KernelEvent::ToolDispatched { tool, .. }) => {
                eprintln!("\n[tool] {} ...", tool);
            }
            Ok(KernelEvent::ToolFinished {
                tool,
                ok,
                duration_ms,
                ..
            }) => {
                let status = if ok { "ok" } else { "failed" };
                eprintln!("[tool] {} {} ({} ms)", tool, status, duration_ms);
            }
            Ok(KernelEvent::Finished { .. }) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Progress printer lagged by {} events", n);
            }
        }
    }
}
