//! Agent Kernel HTTP 入口
//!
//! 启动: cargo run --bin agent-kernel-http --features http -- --listen 127.0.0.1:8080
//!
//! - POST /tasks                 创建任务，立即返回 taskId
//! - GET  /tasks/:id             任务快照
//! - GET  /tasks/:id/turns       Turn 日志
//! - GET  /tasks/:id/events      SSE 进度流（先推送当前快照）
//! - POST /tasks/:id/cancel      取消任务
//! - GET  /tools                 已注册工具

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures_util::stream::{self, Stream};
use serde_json::json;
use tokio::sync::broadcast;

use agent_kernel::config::load_config;
use agent_kernel::core::{Kernel, KernelBuilder, KernelError, TaskId, TaskRequest};
use agent_kernel::observability;
use agent_kernel::react::KernelEvent;

#[derive(Parser, Debug)]
#[command(name = "agent-kernel-http", about = "Serve the agent kernel over HTTP")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        let status = match err {
            KernelError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError(status, err.to_string())
    }
}

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(StatusCode::BAD_REQUEST, format!("invalid task id: {}", raw)))
}

fn not_found(id: &TaskId) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("task {} not found", id))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;
    let kernel = KernelBuilder::from_config(&cfg)
        .context("Failed to build kernel")?
        .build();

    let app = Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(task_status))
        .route("/tasks/:id/turns", get(task_turns))
        .route("/tasks/:id/events", get(task_events))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tools", get(list_tools))
        .with_state(kernel.clone());

    tracing::info!("Agent kernel listening on http://{}", cli.listen);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            kernel.shutdown();
        })
        .await?;

    Ok(())
}

/// POST /tasks：`{principal, instruction, deadline?}` → 202 `{taskId}`
async fn create_task(
    State(kernel): State<Kernel>,
    Json(request): Json<TaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = kernel.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "taskId": id }))))
}

async fn task_status(
    State(kernel): State<Kernel>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw)?;
    kernel.status(&id).map(Json).ok_or_else(|| not_found(&id))
}

async fn task_turns(
    State(kernel): State<Kernel>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw)?;
    kernel.turns(&id).map(Json).ok_or_else(|| not_found(&id))
}

async fn cancel_task(
    State(kernel): State<Kernel>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw)?;
    if kernel.status(&id).is_none() {
        return Err(not_found(&id));
    }
    Ok(Json(json!({ "cancelled": kernel.cancel(&id) })))
}

async fn list_tools(State(kernel): State<Kernel>) -> impl IntoResponse {
    Json(kernel.tool_specs())
}

/// GET /tasks/:id/events：先推送当前快照；任务终态后流结束
async fn task_events(
    State(kernel): State<Kernel>,
    Path(raw): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&raw)?;
    let rx = kernel.subscribe(&id).ok_or_else(|| not_found(&id))?;
    let snapshot = kernel.status(&id).ok_or_else(|| not_found(&id))?;

    let done = snapshot.is_terminal();
    let first = match serde_json::to_string(&snapshot) {
        Ok(data) => Event::default().event("snapshot").data(data),
        Err(e) => Event::default().event("error").data(e.to_string()),
    };

    let event_stream = stream::unfold(
        (Some(first), rx, done),
        |(pending, mut rx, done)| async move {
            if let Some(event) = pending {
                return Some((Ok::<_, Infallible>(event), (None, rx, done)));
            }
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let finished = matches!(ev, KernelEvent::Finished { .. });
                        return Some((Ok(to_sse(&ev, ev.name())), (None, rx, finished)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn to_sse(event: &KernelEvent, name: &str) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}
