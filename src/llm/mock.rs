//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设回复；脚本耗尽后回显最后一条 User 消息。记录每次调用收到的消息，便于断言。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::traits::{parse_structured_reply, with_schema_instruction};
use crate::llm::{LlmClient, LlmError, ModelInfo};
use crate::memory::{Message, Role};

/// Mock 客户端：脚本化回复 + 调用记录
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<Message, LlmError>>>,
    structured: Mutex<VecDeque<Result<Value, LlmError>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = Message>) -> Self {
        let mock = Self::new();
        for r in replies {
            mock.push_reply(r);
        }
        mock
    }

    pub fn push_reply(&self, reply: Message) {
        lock(&self.replies).push_back(Ok(reply));
    }

    pub fn push_error(&self, err: LlmError) {
        lock(&self.replies).push_back(Err(err));
    }

    /// 预设 invoke_structured 的返回
    pub fn push_structured(&self, value: Result<Value, LlmError>) {
        lock(&self.structured).push_back(value);
    }

    /// 每次调用收到的完整消息列表
    pub fn calls(&self) -> Vec<Vec<Message>> {
        lock(&self.calls).clone()
    }

    fn next_reply(&self, messages: &[Message]) -> Result<Message, LlmError> {
        lock(&self.calls).push(messages.to_vec());
        if let Some(reply) = lock(&self.replies).pop_front() {
            return reply;
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "(no input)".to_string());
        Ok(Message::assistant(format!("Echo from Mock: {}", last_user)))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn invoke(&self, messages: &[Message]) -> Result<Message, LlmError> {
        self.next_reply(messages)
    }

    async fn invoke_structured(&self, messages: &[Message], schema: &Value) -> Result<Value, LlmError> {
        let scripted = lock(&self.structured).pop_front();
        match scripted {
            Some(result) => {
                lock(&self.calls).push(messages.to_vec());
                result
            }
            None => {
                let reply = self.next_reply(&with_schema_instruction(messages, schema))?;
                parse_structured_reply(&reply.text())
            }
        }
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "mock".to_string(),
            name: "mock-llm".to_string(),
        }
    }
}
