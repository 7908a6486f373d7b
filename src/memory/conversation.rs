//! 短期记忆：对话历史与消息模型
//!
//! Message 一经创建不再修改；每条消息带唯一 id，用于运行期累积去重。
//! ConversationMemory 保留最近 N 轮对话，超出时自动剪枝；可整体关闭（memory off）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::normalize_output;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 消息内容：纯文本或结构化内容块（不同模型厂商形态不一）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<Value>),
}

impl Content {
    /// 归一化为纯文本
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks.iter().map(normalize_output).collect(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// 助手消息中挂起的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// 调用标识，单次运行内唯一
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCallRequest {
    /// 生成新的调用标识
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            args,
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息身份（同一条消息被框架重复发出时 id 不变）
    pub id: String,
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Tool 消息对应的调用标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: Content) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// 带工具调用的助手消息
    pub fn assistant_with_tool_calls(content: impl Into<Content>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content.into());
        msg.tool_calls = calls;
        msg
    }

    /// 工具结果消息
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// 工具调用的日志文本：仅拼接 type=text 的内容块
    pub fn log_text(&self) -> String {
        match &self.content {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// 不带工具调用的助手消息即候选最终回复
    pub fn is_final_answer(&self) -> bool {
        self.role == Role::Assistant && self.tool_calls.is_empty()
    }

    /// 是否可进入对话历史（只保留 user / assistant）
    pub fn is_conversational(&self) -> bool {
        matches!(self.role, Role::User | Role::Assistant)
    }
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    /// 0 表示不限
    max_turns: usize,
    enabled: bool,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
            enabled: true,
        }
    }

    /// 关闭记忆：push 变为空操作
    pub fn disabled() -> Self {
        Self {
            messages: Vec::new(),
            max_turns: 0,
            enabled: false,
        }
    }

    pub fn push(&mut self, msg: Message) {
        if !self.enabled {
            return;
        }
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        if self.max_turns == 0 {
            return;
        }
        if self.messages.len() > self.max_turns * 2 {
            let keep = self.max_turns * 2;
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_prunes_oldest() {
        let mut mem = ConversationMemory::new(1);
        mem.push(Message::user("a"));
        mem.push(Message::assistant("b"));
        mem.push(Message::user("c"));
        assert_eq!(mem.len(), 2);
        assert_eq!(mem.messages()[0].text(), "b");
    }

    #[test]
    fn test_disabled_memory_ignores_push() {
        let mut mem = ConversationMemory::disabled();
        mem.push(Message::user("hello"));
        assert!(mem.is_empty());
        assert!(!mem.is_enabled());
    }

    #[test]
    fn test_identical_messages_have_distinct_ids() {
        let a = Message::assistant("same");
        let b = Message::assistant("same");
        assert_ne!(a.id, b.id);
        assert_ne!(a, b);
    }

    #[test]
    fn test_log_text_keeps_only_text_blocks() {
        let msg = Message::assistant_with_tool_calls(
            Content::Blocks(vec![
                json!({"type": "text", "text": "I will add"}),
                json!({"type": "tool_use", "id": "x"}),
                json!({"type": "text", "text": "the numbers"}),
            ]),
            vec![ToolCallRequest::with_id("c1", "add", json!({"a": 1}))],
        );
        assert_eq!(msg.log_text(), "I will add\nthe numbers");
        assert!(!msg.is_final_answer());
    }
}
