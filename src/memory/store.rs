//! 记忆库客户端：按任务读取 / 追加 Turn
//!
//! 记忆是优化而非正确性前提：读取失败由内核降级为空上下文，追加失败只记日志。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::TaskId;
use crate::memory::Turn;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store transport error: {0}")]
    Transport(String),
    #[error("memory store returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("memory store response could not be decoded: {0}")]
    Decode(String),
}

/// 记忆库契约
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 读取任务的有序 Turn 序列
    async fn fetch(&self, task_id: &TaskId) -> Result<Vec<Turn>, MemoryError>;

    /// 追加一条 Turn
    async fn append(&self, task_id: &TaskId, turn: &Turn) -> Result<(), MemoryError>;
}

/// 进程内存储默认最多保留的任务数
const DEFAULT_LOCAL_MAX_TASKS: usize = 1_024;

#[derive(Debug, Default)]
struct Shelves {
    turns: HashMap<TaskId, Vec<Turn>>,
    /// 按首次写入排序，用于淘汰
    order: VecDeque<TaskId>,
}

/// 进程内记忆库（未配置远端时使用，也用于测试）；超过容量时淘汰最早写入的任务
#[derive(Debug)]
pub struct InMemoryStore {
    shelves: RwLock<Shelves>,
    max_tasks: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOCAL_MAX_TASKS)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_tasks: usize) -> Self {
        Self {
            shelves: RwLock::new(Shelves::default()),
            max_tasks: max_tasks.max(1),
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn fetch(&self, task_id: &TaskId) -> Result<Vec<Turn>, MemoryError> {
        Ok(self
            .shelves
            .read()
            .await
            .turns
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, task_id: &TaskId, turn: &Turn) -> Result<(), MemoryError> {
        let mut shelves = self.shelves.write().await;
        let Shelves { turns, order } = &mut *shelves;
        match turns.get_mut(task_id) {
            Some(existing) => existing.push(turn.clone()),
            None => {
                turns.insert(task_id.clone(), vec![turn.clone()]);
                order.push_back(task_id.clone());
                while order.len() > self.max_tasks {
                    if let Some(oldest) = order.pop_front() {
                        turns.remove(&oldest);
                        tracing::debug!(task_id = %oldest, "Evicted task history from local memory");
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendBody<'a> {
    task_id: &'a TaskId,
    turn: &'a Turn,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FetchBody {
    Bare(Vec<Turn>),
    Wrapped { turns: Vec<Turn> },
}

/// 远端记忆服务：`GET {base}/turns?taskId=` 与 `POST {base}/turns`
pub struct HttpMemoryStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMemoryStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MemoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MemoryStore for HttpMemoryStore {
    async fn fetch(&self, task_id: &TaskId) -> Result<Vec<Turn>, MemoryError> {
        let response = self
            .client
            .get(format!("{}/turns", self.base_url))
            .query(&[("taskId", task_id.to_string())])
            .send()
            .await
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let body: FetchBody = response
            .json()
            .await
            .map_err(|e| MemoryError::Decode(e.to_string()))?;
        let mut turns = match body {
            FetchBody::Bare(turns) | FetchBody::Wrapped { turns } => turns,
        };
        turns.sort_by_key(|t| t.seq);
        Ok(turns)
    }

    async fn append(&self, task_id: &TaskId, turn: &Turn) -> Result<(), MemoryError> {
        let response = self
            .client
            .post(format!("{}/turns", self.base_url))
            .json(&AppendBody { task_id, turn })
            .send()
            .await
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(MemoryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
