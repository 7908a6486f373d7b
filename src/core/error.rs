//! Agent 错误类型
//!
//! 配置错误在构造时立即返回；初始化失败、执行失败向调用方传播；
//! 结构化输出失败单独归类，便于调用方回退到纯文本模式。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误（配置、初始化、连接、模型、执行、结构化输出）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 构造参数缺失（无模型、无工具来源等），不可重试
    #[error("Config error: {0}")]
    Config(String),

    /// 执行器未就绪
    #[error("Agent not initialized: {0}")]
    NotInitialized(String),

    /// MCP 连接器建立/枚举/关闭失败
    #[error("Connector error: {0}")]
    Connector(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 步骤执行器在流式执行中抛出的错误
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Failed to generate structured output: {0}")]
    StructuredOutput(String),
}

impl AgentError {
    /// 遥测用的错误类别名
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config_error",
            AgentError::NotInitialized(_) => "initialization_error",
            AgentError::Connector(_) => "connector_error",
            AgentError::Llm(_) => "llm_error",
            AgentError::Execution(_) => "execution_error",
            AgentError::JsonParseError(_) => "json_parse_error",
            AgentError::ToolExecutionFailed(_) => "tool_error",
            AgentError::ToolTimeout(_) => "tool_timeout",
            AgentError::StructuredOutput(_) => "structured_output_error",
        }
    }
}
