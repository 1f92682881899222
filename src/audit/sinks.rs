//! 审计写入端：远端服务 / 内存 / tracing 日志

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::audit::{AuditError, AuditEvent, AuditKind, AuditSink};
use crate::core::TaskId;

/// 远端审计服务：`POST {base}/events`
pub struct HttpAuditSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuditSink {
    pub fn new(base_url: &str) -> Result<Self, AuditError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AuditError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let response = self
            .client
            .post(format!("{}/events", self.base_url))
            .json(event)
            .send()
            .await
            .map_err(|e| AuditError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AuditError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// 内存审计（测试与本地检查用）
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds_for(&self, task_id: &TaskId) -> Vec<AuditKind> {
        self.events()
            .into_iter()
            .filter(|e| &e.task_id == task_id)
            .map(|e| e.kind)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .map_err(|e| AuditError::Transport(e.to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// 未配置审计服务时：每个事件输出一行 JSON 日志
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(event).map_err(|e| AuditError::Transport(e.to_string()))?;
        tracing::info!(target: "audit", event = %line, "audit");
        Ok(())
    }
}
