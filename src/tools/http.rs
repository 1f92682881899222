//! 网络工具适配器：把调用 POST 到独立部署的适配器服务
//!
//! 请求体为 ToolInvocation（camelCase），响应体为 AdapterResponse。超时由 ToolDispatcher 统一施加。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{AdapterError, AdapterResponse, ToolAdapter, ToolInvocation};

pub struct HttpToolAdapter {
    name: String,
    description: String,
    schema: Value,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpToolAdapter {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        endpoint: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl ToolAdapter for HttpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<AdapterResponse, AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&invocation)
            .send()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<AdapterResponse>()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))
    }
}
