//! 内核配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `KERNEL__*` 覆盖（双下划线表示嵌套，如 `KERNEL__LLM__PROVIDER=bedrock`）。
//! 所有段都有默认值，空配置即可运行（Mock 后端 + 进程内协作方）。时长统一以毫秒表示。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.
Use the registered tools for all factual operations.
- Only call tools when needed.
- Always show reasoning briefly before result.
- If a tool fails, apologize and explain.
- Keep answers concise and accurate.";

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub kernel: KernelSection,
    pub llm: LlmSection,
    pub authz: AuthzSection,
    pub memory: MemorySection,
    pub audit: AuditSection,
    pub tools: ToolsSection,
}

/// [kernel] 段：轮次、并发、各类超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    pub max_rounds: u32,
    pub max_parallel_tool_calls: usize,
    pub per_tool_timeout_ms: u64,
    pub model_timeout_ms: u64,
    /// 请求未带 deadline 时使用
    pub default_deadline_ms: u64,
    /// 协作取消后等待执行体退出的宽限期
    pub cancel_grace_ms: u64,
    /// 终态任务在任务表中保留多久（之后 status / turns 返回 None）
    pub retention_ms: u64,
    pub system_prompt: Option<String>,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_parallel_tool_calls: 4,
            per_tool_timeout_ms: 30_000,
            model_timeout_ms: 120_000,
            default_deadline_ms: 600_000,
            cancel_grace_ms: 2_000,
            retention_ms: 300_000,
            system_prompt: None,
        }
    }
}

/// [llm] 段：后端选择与采样参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / bedrock / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub bedrock: BedrockSection,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: Some(0.0),
            top_p: Some(0.95),
            max_tokens: Some(2048),
            bedrock: BedrockSection::default(),
            retry: RetrySection::default(),
        }
    }
}

/// [llm.bedrock] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BedrockSection {
    pub region: String,
    pub endpoint: Option<String>,
    pub api_key_env: String,
}

impl Default for BedrockSection {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            api_key_env: "AWS_BEARER_TOKEN_BEDROCK".to_string(),
        }
    }
}

/// [llm.retry] 段：模型调用的退避重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter_ratio: 0.2,
        }
    }
}

/// [authz] 段：未配置 base_url 时使用静态放行策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthzSection {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    /// 仅静态策略使用
    pub deny_tools: Vec<String>,
}

impl Default for AuthzSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 2_000,
            deny_tools: Vec::new(),
        }
    }
}

/// [memory] 段：未配置 base_url 时使用进程内存储
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    /// 进程内存储最多保留的任务数，超出时淘汰最早写入的任务
    pub local_max_tasks: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 1_500,
            local_max_tasks: 1_024,
        }
    }
}

/// [audit] 段：未配置 base_url 时写 tracing 日志
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 1_000,
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

/// [tools] 段：内置工具开关与网络适配器列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub builtin: bool,
    pub adapters: Vec<AdapterEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            builtin: true,
            adapters: Vec::new(),
        }
    }
}

/// [[tools.adapters]]：schema 为 JSON 字符串
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    #[serde(default)]
    pub schema: Option<String>,
}

/// 内核运行限制（已做下限钳制）
#[derive(Debug, Clone, PartialEq)]
pub struct KernelLimits {
    pub max_rounds: u32,
    pub max_parallel_tool_calls: usize,
    pub per_tool_timeout: Duration,
    pub model_timeout: Duration,
    pub default_deadline: Duration,
    pub cancel_grace: Duration,
    pub retention: Duration,
}

impl Default for KernelLimits {
    fn default() -> Self {
        Self::from(&KernelSection::default())
    }
}

impl From<&KernelSection> for KernelLimits {
    fn from(section: &KernelSection) -> Self {
        Self {
            max_rounds: section.max_rounds.max(1),
            max_parallel_tool_calls: section.max_parallel_tool_calls.max(1),
            per_tool_timeout: Duration::from_millis(section.per_tool_timeout_ms),
            model_timeout: Duration::from_millis(section.model_timeout_ms),
            default_deadline: Duration::from_millis(section.default_deadline_ms),
            cancel_grace: Duration::from_millis(section.cancel_grace_ms),
            retention: Duration::from_millis(section.retention_ms),
        }
    }
}

/// 从 config 目录加载配置，环境变量 KERNEL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 则追加该文件（可覆盖前面的键）；文件不存在即报错
/// 3. 最后叠加环境变量 KERNEL__*（双下划线表示嵌套键）
///
/// 任何解析错误都返回 Err，调用方不得回退到默认配置（默认是放行策略）。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(config::ConfigError::NotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KERNEL")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "mock");
        assert!(cfg.tools.builtin);
        let limits = KernelLimits::from(&cfg.kernel);
        assert_eq!(limits.max_rounds, 8);
        assert_eq!(limits.per_tool_timeout, Duration::from_secs(30));
        assert_eq!(limits.retention, Duration::from_secs(300));
        assert_eq!(cfg.memory.local_max_tasks, 1_024);
    }

    #[test]
    fn test_limits_are_clamped() {
        let section = KernelSection {
            max_rounds: 0,
            max_parallel_tool_calls: 0,
            ..KernelSection::default()
        };
        let limits = KernelLimits::from(&section);
        assert_eq!(limits.max_rounds, 1);
        assert_eq!(limits.max_parallel_tool_calls, 1);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[kernel]
max_rounds = 3
per_tool_timeout_ms = 2000

[llm]
provider = "bedrock"
model = "amazon.nova-lite-v1:0"

[llm.bedrock]
region = "ap-south-1"

[audit]
max_attempts = 5

[[tools.adapters]]
name = "add"
description = "Add two numbers"
endpoint = "http://adder:9000/invoke"
schema = '{{"type":"object","required":["a","b"]}}'
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.kernel.max_rounds, 3);
        assert_eq!(cfg.kernel.max_parallel_tool_calls, 4);
        assert_eq!(cfg.llm.provider, "bedrock");
        assert_eq!(cfg.llm.bedrock.region, "ap-south-1");
        assert_eq!(cfg.audit.max_attempts, 5);
        assert_eq!(cfg.tools.adapters.len(), 1);
        assert_eq!(cfg.tools.adapters[0].name, "add");
        assert!(cfg.tools.builtin);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("prod.toml");
        let err = load_config(Some(missing)).unwrap_err();
        assert!(matches!(err, config::ConfigError::NotFound(_)));
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[authz]
base_url = "http://authz:8080"
timeout_ms = "two seconds"
"#
        )
        .unwrap();
        assert!(load_config(Some(file.path().to_path_buf())).is_err());
    }
}
