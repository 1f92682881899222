//! 内核构建器：统一的内核初始化逻辑
//!
//! `KernelBuilder::new()` 得到一个可直接运行的开发内核（Mock 后端、内置工具、静态放行策略、
//! tracing 审计、进程内记忆库）；`from_config` 按配置替换为真实协作方。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::audit::{AuditEmitter, AuditSink, HttpAuditSink, TracingAuditSink};
use crate::authz::{AuthzClient, AuthzGate, HttpAuthzClient, StaticPolicy};
use crate::config::{AppConfig, KernelLimits, LlmSection, DEFAULT_SYSTEM_PROMPT};
use crate::core::orchestrator::KernelServices;
use crate::core::{Kernel, KernelError, RecoveryEngine, RetryPolicy};
use crate::llm::{BedrockProvider, LlmProvider, MockProvider, ModelOptions, OpenAiProvider};
use crate::memory::{HttpMemoryStore, InMemoryStore, MemoryStore};
use crate::react::Planner;
use crate::tools::{EchoTool, HttpToolAdapter, NoopTool, ToolAdapter, ToolDispatcher, ToolRegistry};

/// 内核构建器
pub struct KernelBuilder {
    provider: Arc<dyn LlmProvider>,
    registry: ToolRegistry,
    authz: Arc<dyn AuthzClient>,
    audit_sink: Arc<dyn AuditSink>,
    memory: Arc<dyn MemoryStore>,
    limits: KernelLimits,
    system_prompt: String,
    options: ModelOptions,
    provider_retry: RetryPolicy,
    audit_retry: RetryPolicy,
    authz_timeout: Duration,
    memory_timeout: Duration,
    audit_timeout: Duration,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(MockProvider),
            registry: builtin_tools(),
            authz: Arc::new(StaticPolicy::allow_all()),
            audit_sink: Arc::new(TracingAuditSink),
            memory: Arc::new(InMemoryStore::new()),
            limits: KernelLimits::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            options: ModelOptions::default(),
            provider_retry: RetryPolicy::default(),
            audit_retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)),
            authz_timeout: Duration::from_secs(2),
            memory_timeout: Duration::from_millis(1500),
            audit_timeout: Duration::from_secs(1),
        }
    }

    /// 按配置构建：选择 LLM 后端，远端协作方只在配置了 base_url 时启用
    pub fn from_config(cfg: &AppConfig) -> Result<Self, KernelError> {
        let mut builder = Self::new()
            .limits(KernelLimits::from(&cfg.kernel))
            .provider(create_provider(&cfg.llm)?)
            .options(ModelOptions {
                temperature: cfg.llm.temperature,
                top_p: cfg.llm.top_p,
                max_tokens: cfg.llm.max_tokens,
            })
            .provider_retry(
                RetryPolicy::new(
                    cfg.llm.retry.max_attempts,
                    Duration::from_millis(cfg.llm.retry.base_delay_ms),
                    Duration::from_millis(cfg.llm.retry.max_delay_ms),
                )
                .with_jitter(cfg.llm.retry.jitter_ratio),
            )
            .tools(tools_from_config(cfg)?)
            .authz_timeout(Duration::from_millis(cfg.authz.timeout_ms))
            .memory_timeout(Duration::from_millis(cfg.memory.timeout_ms))
            .audit_timeout(Duration::from_millis(cfg.audit.timeout_ms))
            .audit_retry(RetryPolicy::new(
                cfg.audit.max_attempts,
                Duration::from_millis(cfg.audit.backoff_ms),
                Duration::from_millis(cfg.audit.backoff_ms.saturating_mul(16)),
            ));

        if let Some(prompt) = &cfg.kernel.system_prompt {
            builder = builder.system_prompt(prompt.as_str());
        }

        builder = match &cfg.authz.base_url {
            Some(url) => {
                tracing::info!("Using authorization service at {}", url);
                let client = HttpAuthzClient::new(url, Duration::from_millis(cfg.authz.timeout_ms))
                    .map_err(|e| KernelError::Config(e.to_string()))?;
                builder.authz(Arc::new(client))
            }
            None => {
                tracing::warn!("No authorization service configured, using static allow policy");
                let policy = cfg
                    .authz
                    .deny_tools
                    .iter()
                    .fold(StaticPolicy::allow_all(), |p, tool| p.deny_tool(tool.as_str()));
                builder.authz(Arc::new(policy))
            }
        };

        builder = match &cfg.memory.base_url {
            Some(url) => {
                let store = HttpMemoryStore::new(url, Duration::from_millis(cfg.memory.timeout_ms))
                    .map_err(|e| KernelError::Config(e.to_string()))?;
                builder.memory(Arc::new(store))
            }
            None => builder.memory(Arc::new(InMemoryStore::with_capacity(
                cfg.memory.local_max_tasks,
            ))),
        };

        builder = match &cfg.audit.base_url {
            Some(url) => {
                let sink = HttpAuditSink::new(url).map_err(|e| KernelError::Config(e.to_string()))?;
                builder.audit_sink(Arc::new(sink))
            }
            None => {
                tracing::warn!("No audit service configured, audit events go to the log");
                builder.audit_sink(Arc::new(TracingAuditSink))
            }
        };

        Ok(builder)
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// 替换整个工具注册表
    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 追加一个工具；参数 schema 无法编译时返回配置错误
    pub fn register_tool(mut self, adapter: impl ToolAdapter + 'static) -> Result<Self, KernelError> {
        self.registry
            .register(adapter)
            .map_err(|e| KernelError::Config(e.to_string()))?;
        Ok(self)
    }

    pub fn authz(mut self, client: Arc<dyn AuthzClient>) -> Self {
        self.authz = client;
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn memory(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory = store;
        self
    }

    pub fn limits(mut self, limits: KernelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn provider_retry(mut self, retry: RetryPolicy) -> Self {
        self.provider_retry = retry;
        self
    }

    pub fn audit_retry(mut self, retry: RetryPolicy) -> Self {
        self.audit_retry = retry;
        self
    }

    pub fn authz_timeout(mut self, timeout: Duration) -> Self {
        self.authz_timeout = timeout;
        self
    }

    pub fn memory_timeout(mut self, timeout: Duration) -> Self {
        self.memory_timeout = timeout;
        self
    }

    pub fn audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    pub fn build(self) -> Kernel {
        tracing::info!(
            provider = self.provider.name(),
            tools = ?self.registry.tool_names(),
            max_rounds = self.limits.max_rounds,
            "Kernel ready"
        );
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(self.registry),
            self.limits.per_tool_timeout,
        ));
        let planner = Planner::new(
            self.provider,
            self.system_prompt,
            self.options,
            self.provider_retry,
            self.limits.model_timeout,
        );
        Kernel::new(KernelServices {
            planner,
            dispatcher,
            authz: AuthzGate::new(self.authz, self.authz_timeout),
            audit: AuditEmitter::new(self.audit_sink, self.audit_timeout, self.audit_retry),
            memory: self.memory,
            memory_timeout: self.memory_timeout,
            recovery: RecoveryEngine::new(),
            limits: self.limits,
        })
    }
}

fn builtin_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for result in [registry.register(EchoTool), registry.register(NoopTool)] {
        if let Err(e) = result {
            tracing::error!(error = %e, "Builtin tool not registered");
        }
    }
    registry
}

/// 根据 [llm].provider 选择后端（openai / bedrock / mock）
fn create_provider(llm: &LlmSection) -> Result<Arc<dyn LlmProvider>, KernelError> {
    match llm.provider.to_lowercase().as_str() {
        "openai" => {
            let key = std::env::var(&llm.api_key_env).ok();
            tracing::info!("Using OpenAI-compatible LLM ({})", llm.model);
            Ok(Arc::new(OpenAiProvider::new(
                llm.base_url.as_deref(),
                &llm.model,
                key,
            )))
        }
        "bedrock" => {
            let key = std::env::var(&llm.bedrock.api_key_env).ok();
            tracing::info!("Using Bedrock LLM ({}, {})", llm.model, llm.bedrock.region);
            let provider = BedrockProvider::new(
                &llm.bedrock.region,
                llm.bedrock.endpoint.as_deref(),
                &llm.model,
                key,
            )
            .map_err(|e| KernelError::Config(e.to_string()))?;
            Ok(Arc::new(provider))
        }
        "mock" => {
            tracing::warn!("Using Mock LLM");
            Ok(Arc::new(MockProvider))
        }
        other => Err(KernelError::Config(format!("unknown llm provider: {}", other))),
    }
}

/// 内置工具 + [[tools.adapters]] 中的网络适配器
fn tools_from_config(cfg: &AppConfig) -> Result<ToolRegistry, KernelError> {
    let mut registry = if cfg.tools.builtin {
        builtin_tools()
    } else {
        ToolRegistry::new()
    };
    if cfg.tools.adapters.is_empty() {
        return Ok(registry);
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| KernelError::Config(e.to_string()))?;
    for entry in &cfg.tools.adapters {
        let schema: Value = match &entry.schema {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                KernelError::Config(format!("tool {}: invalid schema: {}", entry.name, e))
            })?,
            None => json!({ "type": "object" }),
        };
        registry
            .register(HttpToolAdapter::new(
                entry.name.as_str(),
                entry.description.as_str(),
                schema,
                entry.endpoint.as_str(),
                client.clone(),
            ))
            .map_err(|e| KernelError::Config(e.to_string()))?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterEntry;

    #[test]
    fn test_unknown_provider_is_a_config_error() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "nope".into();
        assert!(matches!(
            KernelBuilder::from_config(&cfg),
            Err(KernelError::Config(_))
        ));
    }

    #[test]
    fn test_adapters_join_builtin_tools() {
        let mut cfg = AppConfig::default();
        cfg.tools.adapters.push(AdapterEntry {
            name: "add".into(),
            description: "Add two numbers".into(),
            endpoint: "http://127.0.0.1:9/invoke".into(),
            schema: Some(r#"{"type":"object","required":["a","b"]}"#.into()),
        });
        let registry = tools_from_config(&cfg).unwrap();
        assert_eq!(registry.tool_names(), vec!["add", "echo", "noop"]);
    }

    #[test]
    fn test_invalid_adapter_schema_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.tools.builtin = false;
        cfg.tools.adapters.push(AdapterEntry {
            name: "broken".into(),
            description: String::new(),
            endpoint: "http://127.0.0.1:9/invoke".into(),
            schema: Some("{not json".into()),
        });
        assert!(matches!(tools_from_config(&cfg), Err(KernelError::Config(_))));
    }

    #[test]
    fn test_adapter_schema_that_is_not_a_schema_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.tools.adapters.push(AdapterEntry {
            name: "add".into(),
            description: String::new(),
            endpoint: "http://127.0.0.1:9/invoke".into(),
            schema: Some(r#"{"type":"object","properties":{"a":{"type":"numbr"}}}"#.into()),
        });
        match tools_from_config(&cfg) {
            Err(KernelError::Config(msg)) => assert!(msg.contains("add")),
            other => panic!("expected config error, got {:?}", other.map(|r| r.tool_names())),
        }
    }

    #[tokio::test]
    async fn test_default_kernel_lists_builtin_tools() {
        let kernel = KernelBuilder::new().build();
        let names: Vec<_> = kernel.tool_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "noop"]);
    }
}
