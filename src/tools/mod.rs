//! 工具层：适配器契约、注册表、参数校验、派发器、内置与网络适配器

pub mod echo;
pub mod executor;
pub mod http;
pub mod registry;
pub mod schema;

pub use echo::{EchoTool, NoopTool};
pub use executor::ToolDispatcher;
pub use http::HttpToolAdapter;
pub use registry::{
    AdapterError, AdapterResponse, RegisteredTool, SchemaError, ToolAdapter, ToolInvocation,
    ToolRegistry, ToolSpec,
};
pub use schema::ArgumentSchema;
