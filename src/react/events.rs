//! 运行事件：编排器对调用方输出的统一事件流，以及步骤执行器的节点更新

use serde::Serialize;
use serde_json::Value;

use crate::memory::Message;

/// 对调用方的事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 推理计划（若请求，恒为第一个事件）
    Plan { text: String },
    /// 发起工具调用
    ToolInvoked {
        tool: String,
        args: Value,
        call_id: String,
        /// 发起调用时助手消息中的文本部分
        log: String,
    },
    /// 工具返回，与 ToolInvoked 按 call_id 一一配对
    ToolResult {
        tool: String,
        args: Value,
        call_id: String,
        observation: String,
    },
    /// 最终回复（文本）
    FinalAnswer { text: String },
    /// 最终回复（结构化）
    StructuredAnswer { value: Value },
}

impl AgentEvent {
    /// 是否为终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::FinalAnswer { .. } | AgentEvent::StructuredAnswer { .. })
    }
}

/// 步骤执行器的一次节点更新：`model`（模型输出）或 `tools`（工具结果）
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub node: String,
    pub messages: Vec<Message>,
}

impl StepUpdate {
    pub fn new(node: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            node: node.into(),
            messages,
        }
    }
}
