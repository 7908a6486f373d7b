//! 工具层：Tool trait、注册表、带超时的执行器、工具调用 Schema

pub mod executor;
pub mod registry;
pub mod schema;

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use schema::tool_call_schema_json;
