//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：invoke（直接调用，返回助手消息）、
//! invoke_structured（绑定 JSON Schema 的结构化调用）。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::llm::normalize::extract_json_block;
use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("empty response")]
    EmptyResponse,
}

/// 模型身份（遥测用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub provider: String,
    pub name: String,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            provider: "unknown".to_string(),
            name: "unknown".to_string(),
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 直接调用模型（不经过工具循环），返回助手消息；内容形态可能是文本或内容块
    async fn invoke(&self, messages: &[Message]) -> Result<Message, LlmError>;

    /// 绑定目标 Schema 的结构化调用，返回 JSON 对象
    ///
    /// 默认实现：追加一条 system 指令要求只输出符合 Schema 的 JSON，再从回复中抽取 JSON。
    async fn invoke_structured(&self, messages: &[Message], schema: &Value) -> Result<Value, LlmError> {
        let full = with_schema_instruction(messages, schema);
        let reply = self.invoke(&full).await?;
        parse_structured_reply(&reply.text())
    }

    /// 模型提供方与名称，默认 unknown
    fn model_info(&self) -> ModelInfo {
        ModelInfo::default()
    }
}

pub(crate) fn with_schema_instruction(messages: &[Message], schema: &Value) -> Vec<Message> {
    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    let mut full = messages.to_vec();
    full.push(Message::system(format!(
        "Respond with a single JSON object that conforms to this JSON Schema. \
         Output only the JSON, without Markdown or extra text.\n{}",
        schema_text
    )));
    full
}

pub(crate) fn parse_structured_reply(text: &str) -> Result<Value, LlmError> {
    let json_str = extract_json_block(text)
        .ok_or_else(|| LlmError::InvalidResponse(format!("no JSON object in reply: {}", text)))?;
    serde_json::from_str(json_str).map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, json_str)))
}
