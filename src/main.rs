//! mcp-hive 演示入口
//!
//! 初始化日志、加载配置，挂一个本地 math 连接器，对命令行给出的查询流式执行并打印事件。
//! 未设置 OPENAI_API_KEY 时使用 Mock LLM。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use mcp_hive::{
    create_llm_from_config, load_config, observability, AgentEvent, McpAgentBuilder, RunOptions, StaticConnector,
    Tool, ToolRegistry,
};
use serde_json::{json, Value};

struct Add;

#[async_trait]
impl Tool for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers a and b"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
            "required": ["a", "b"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let a = args["a"].as_f64().ok_or("missing number 'a'")?;
        let b = args["b"].as_f64().ok_or("missing number 'b'")?;
        Ok((a + b).to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let query = if query.is_empty() {
        "What is 10 + 20?".to_string()
    } else {
        query
    };

    let mut registry = ToolRegistry::new();
    registry.register(Add);
    let mut agent = McpAgentBuilder::from_config(&cfg)
        .llm(create_llm_from_config(&cfg))
        .connector(Arc::new(StaticConnector::new("math", registry)))
        .build()
        .context("Failed to create agent")?;

    let mut events = agent.stream(query, RunOptions::default());
    while let Some(event) = events.next().await {
        match event.context("Agent run failed")? {
            AgentEvent::Plan { text } => println!("{text}"),
            AgentEvent::ToolInvoked { tool, args, .. } => println!("-> {tool} {args}"),
            AgentEvent::ToolResult { tool, observation, .. } => println!("<- {tool}: {observation}"),
            AgentEvent::FinalAnswer { text } => println!("\n{text}"),
            AgentEvent::StructuredAnswer { value } => println!("\n{value:#}"),
        }
    }
    Ok(())
}
