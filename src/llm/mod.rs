//! LLM 层：后端抽象与实现（OpenAI 兼容 / Bedrock / Mock）

pub mod bedrock;
pub mod mock;
pub mod openai;
pub mod traits;

pub use bedrock::BedrockProvider;
pub use mock::{MockProvider, Script, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use traits::{
    ChunkStream, LlmProvider, ModelChunk, ModelOptions, ModelOutput, ModelRequest, ProviderError,
    StopReason, TokenUsage,
};
