//! 步骤执行器
//!
//! StepExecutor 接收消息列表，驱动一次有界的 ReAct 循环并输出节点更新流；
//! 同一次 stream 内，每条工具调用消息之后必然跟随其对应的工具结果消息。
//! 默认实现 ReactStepExecutor：模型回复原生 tool_calls 或文本 JSON（`{"tool": ..., "args": {...}}`），
//! 工具经 ToolExecutor 执行，失败转为 `Error: ...` 观察结果。

use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::{extract_json_block, LlmClient};
use crate::mcp::CatalogTool;
use crate::memory::{Message, ToolCallRequest};
use crate::react::events::StepUpdate;
use crate::tools::{tool_call_schema_json, ToolExecutor, ToolRegistry};

pub type StepStream = Pin<Box<dyn Stream<Item = Result<StepUpdate, AgentError>> + Send>>;

/// 一次构建对应固定的工具集与系统提示词
pub trait StepExecutor: Send + Sync {
    fn stream(&self, messages: Vec<Message>) -> StepStream;
}

/// 按工具集与系统提示词构建执行器
pub trait StepExecutorFactory: Send + Sync {
    fn build(&self, tools: Vec<CatalogTool>, system_prompt: String, max_steps: usize) -> Arc<dyn StepExecutor>;
}

/// LLM 文本中的工具调用（`{"tool": "add", "args": {"a": 1}}`）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 文本解析结果
#[derive(Debug, Clone)]
pub enum ParsedOutput {
    /// 直接回复用户
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 解析 LLM 输出：含有效 JSON 且 tool 非空则为 ToolCall，否则为 Response；
/// 形似工具调用但 JSON 非法时返回 JsonParseError
pub fn parse_llm_output(output: &str) -> Result<ParsedOutput, AgentError> {
    let trimmed = output.trim();
    let Some(json_str) = extract_json_block(trimmed) else {
        return Ok(ParsedOutput::Response(trimmed.to_string()));
    };

    match serde_json::from_str::<ToolCall>(json_str) {
        Ok(parsed) if !parsed.tool.is_empty() => Ok(ParsedOutput::ToolCall(parsed)),
        Ok(_) => Ok(ParsedOutput::Response(trimmed.to_string())),
        Err(e) if json_str.contains("\"tool\"") => {
            Err(AgentError::JsonParseError(format!("{}: {}", e, json_str)))
        }
        Err(_) => Ok(ParsedOutput::Response(trimmed.to_string())),
    }
}

const JSON_RETRY_PROMPT: &str = "Your last reply looked like a tool call but was not valid JSON. \
Reply again with exactly one JSON object of the form {\"tool\": \"<name>\", \"args\": {...}}, \
or answer in plain text if no tool is needed.";

/// 默认执行器工厂
pub struct ReactExecutorFactory {
    llm: Arc<dyn LlmClient>,
    tool_timeout_secs: u64,
}

impl ReactExecutorFactory {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            tool_timeout_secs: 30,
        }
    }

    pub fn with_tool_timeout(mut self, secs: u64) -> Self {
        self.tool_timeout_secs = secs;
        self
    }
}

impl StepExecutorFactory for ReactExecutorFactory {
    fn build(&self, tools: Vec<CatalogTool>, system_prompt: String, max_steps: usize) -> Arc<dyn StepExecutor> {
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        tracing::info!("Agent ready with tools: {}", names.join(", "));
        let mut registry = ToolRegistry::new();
        for t in &tools {
            registry.register_arc(Arc::clone(&t.tool));
        }
        let mut system_prompt = system_prompt;
        if !registry.is_empty() {
            system_prompt.push_str("\n\nTool parameters (JSON Schema of \"args\" for each tool):\n");
            system_prompt.push_str(&registry.to_schema_json());
        }
        let system_prompt = format!(
            "{}\n\nTo call a tool, reply with a single JSON object matching this schema:\n{}",
            system_prompt,
            tool_call_schema_json()
        );
        Arc::new(ReactStepExecutor {
            llm: Arc::clone(&self.llm),
            tools: ToolExecutor::new(tools.into_iter().map(|t| t.tool), self.tool_timeout_secs),
            system_prompt,
            max_steps,
        })
    }
}

/// 默认步骤执行器：每步调用一次模型，最多 max_steps 次
#[derive(Clone)]
pub struct ReactStepExecutor {
    llm: Arc<dyn LlmClient>,
    tools: ToolExecutor,
    system_prompt: String,
    max_steps: usize,
}

impl ReactStepExecutor {
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

impl StepExecutor for ReactStepExecutor {
    fn stream(&self, messages: Vec<Message>) -> StepStream {
        let this = self.clone();
        let s = try_stream! {
            let mut history = messages;
            let mut model_calls = 0usize;
            loop {
                if model_calls >= this.max_steps {
                    let msg = Message::assistant(format!(
                        "Agent stopped after reaching the maximum number of steps ({}).",
                        this.max_steps
                    ));
                    yield StepUpdate::new("model", vec![msg]);
                    break;
                }
                model_calls += 1;

                let mut full = Vec::with_capacity(history.len() + 1);
                full.push(Message::system(this.system_prompt.clone()));
                full.extend(history.iter().cloned());
                let reply = this.llm.invoke(&full).await.map_err(AgentError::from)?;

                let model_msg = if !reply.tool_calls.is_empty() {
                    reply
                } else {
                    match parse_llm_output(&reply.text()) {
                        Ok(ParsedOutput::Response(_)) => {
                            yield StepUpdate::new("model", vec![reply]);
                            break;
                        }
                        Ok(ParsedOutput::ToolCall(tc)) => Message::assistant_with_tool_calls(
                            reply.content.clone(),
                            vec![ToolCallRequest::new(tc.tool, tc.args)],
                        ),
                        Err(e) => {
                            tracing::warn!("Malformed tool call, asking model to retry: {}", e);
                            history.push(reply);
                            history.push(Message::user(JSON_RETRY_PROMPT));
                            continue;
                        }
                    }
                };

                let calls = model_msg.tool_calls.clone();
                history.push(model_msg.clone());
                yield StepUpdate::new("model", vec![model_msg]);

                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    let observation = match this.tools.execute(&call.name, call.args.clone()).await {
                        Ok(out) => out,
                        Err(e) => format!("Error: {}", e),
                    };
                    results.push(Message::tool_result(call.id.clone(), observation));
                }
                history.extend(results.iter().cloned());
                yield StepUpdate::new("tools", results);
            }
        };
        Box::pin(s)
    }
}
