//! mcp-hive - Rust MCP 智能体编排层
//!
//! 模块划分：
//! - **agent**: McpAgent 门面（run / stream / 结构化输出、连接器生命周期、对话历史）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: 连接器契约、工具目录、服务器管理模式
//! - **memory**: 消息模型与对话历史
//! - **observability**: 日志初始化与运行遥测
//! - **react**: 步骤执行器、流式编排（中断-重启）、推理计划、结构化输出
//! - **tools**: Tool trait、注册表与带超时的执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{FinalOutput, McpAgent, McpAgentBuilder, RunOptions, RunResult};
pub use config::{load_config, AppConfig};
pub use core::AgentError;
pub use llm::{create_llm_from_config, LlmClient, MockLlmClient};
pub use mcp::{ConnectorCatalog, McpConnector, ServerManager, StaticConnector, ToolCatalog};
pub use memory::Message;
pub use react::{AgentEvent, OutputSchema};
pub use tools::{Tool, ToolRegistry};
