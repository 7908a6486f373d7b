//! 单次运行的瞬态状态
//!
//! 累积消息（去重）、挂起的工具调用（按 call_id 配对）、重启计数、步数、候选最终回复。
//! 去重键：工具结果 `tool:<call_id>`；带调用的助手消息 `calls:<ids>`；其余 `msg:<id>`。

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::memory::{Message, Role, ToolCallRequest};

/// 等待结果的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub name: String,
    pub args: Value,
    pub log: String,
}

/// 消息去重键
pub fn dedup_key(msg: &Message) -> String {
    if msg.role == Role::Tool {
        if let Some(id) = &msg.tool_call_id {
            return format!("tool:{id}");
        }
    }
    if !msg.tool_calls.is_empty() {
        let ids: Vec<&str> = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
        return format!("calls:{}", ids.join(","));
    }
    format!("msg:{}", msg.id)
}

#[derive(Debug, Default)]
pub struct RunState {
    messages: Vec<Message>,
    seen: HashSet<String>,
    pending: HashMap<String, PendingToolCall>,
    pub restarts: usize,
    /// 本次运行发起的工具调用数
    pub steps: usize,
    final_answer: Option<String>,
}

impl RunState {
    /// 以历史 + 本次查询为起点
    pub fn new(initial: Vec<Message>) -> Self {
        let seen = initial.iter().map(dedup_key).collect();
        Self {
            messages: initial,
            seen,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 追加新消息；已存在（同键）则忽略并返回 false
    pub fn accumulate(&mut self, msg: &Message) -> bool {
        if !self.seen.insert(dedup_key(msg)) {
            return false;
        }
        self.messages.push(msg.clone());
        true
    }

    /// 登记挂起调用；同一 call_id 只登记一次
    pub fn register_call(&mut self, call: &ToolCallRequest, log: &str) -> bool {
        if self.pending.contains_key(&call.id) {
            return false;
        }
        self.pending.insert(
            call.id.clone(),
            PendingToolCall {
                name: call.name.clone(),
                args: call.args.clone(),
                log: log.to_string(),
            },
        );
        true
    }

    /// 消费挂起调用；未知或已消费的 call_id 返回 None
    pub fn resolve(&mut self, call_id: &str) -> Option<PendingToolCall> {
        self.pending.remove(call_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn set_final_answer(&mut self, text: String) {
        self.final_answer = Some(text);
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replayed_message_not_duplicated() {
        let query = Message::user("q");
        let mut state = RunState::new(vec![query.clone()]);
        assert!(!state.accumulate(&query));

        let a = Message::assistant("same text");
        let b = Message::assistant("same text");
        assert!(state.accumulate(&a));
        assert!(!state.accumulate(&a));
        assert!(state.accumulate(&b));
        assert_eq!(state.messages().len(), 3);
    }

    #[test]
    fn test_tool_messages_keyed_by_call_id() {
        let mut state = RunState::new(Vec::new());
        let call = ToolCallRequest::with_id("c1", "add", json!({"a": 1, "b": 2}));
        let inv1 = Message::assistant_with_tool_calls("", vec![call.clone()]);
        let inv2 = Message::assistant_with_tool_calls("re-emitted", vec![call.clone()]);
        assert!(state.accumulate(&inv1));
        assert!(!state.accumulate(&inv2));
        assert!(state.accumulate(&Message::tool_result("c1", "3")));
        assert!(!state.accumulate(&Message::tool_result("c1", "3")));
    }

    #[test]
    fn test_pending_resolves_exactly_once() {
        let mut state = RunState::new(Vec::new());
        let call = ToolCallRequest::with_id("c1", "add", json!({}));
        assert!(state.register_call(&call, "adding"));
        assert!(!state.register_call(&call, "adding"));
        assert!(state.has_pending());
        let p = state.resolve("c1").unwrap();
        assert_eq!(p.name, "add");
        assert_eq!(p.log, "adding");
        assert!(state.resolve("c1").is_none());
        assert!(state.resolve("unknown").is_none());
        assert!(!state.has_pending());
    }
}
