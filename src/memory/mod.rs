//! 记忆层：消息模型与短期对话历史

pub mod conversation;

pub use conversation::{Content, ConversationMemory, Message, Role, ToolCallRequest};
