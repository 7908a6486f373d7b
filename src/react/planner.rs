//! 推理计划：执行前让模型用自然语言说明将使用哪些服务器与工具、顺序与原因
//!
//! 仅用于可观测性，不约束实际执行。模型调用失败时回退为「查询 + 工具列表」的静态计划，永不报错。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::LlmClient;
use crate::mcp::CatalogTool;
use crate::memory::Message;

const BANNER_WIDTH: usize = 60;

pub struct ReasoningPlanner {
    llm: Arc<dyn LlmClient>,
}

impl ReasoningPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// `- name (Server: server): description`，每行一个工具
    pub fn tool_info(tools: &[CatalogTool], server_map: &BTreeMap<String, String>) -> String {
        if tools.is_empty() {
            return "No tools available.".to_string();
        }
        tools
            .iter()
            .map(|t| {
                let server = server_map.get(t.name()).map(String::as_str).unwrap_or("unknown");
                format!("- {} (Server: {}): {}", t.name(), server, t.description())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn generate(&self, query: &str, tools: &[CatalogTool], server_map: &BTreeMap<String, String>) -> String {
        let tool_info = Self::tool_info(tools, server_map);
        let prompt = format!(
            "You are an AI assistant that needs to plan how to answer a user's query using available MCP (Model Context Protocol) tools.

User Query: {query}

Available Tools:
{tool_info}

Please analyze the query and create a plan that specifies:
1. Which MCP servers need to be used (if using server manager mode)
2. Which specific tools from each server should be called
3. The order in which tools should be called
4. A brief explanation of why each tool is needed

Format your response as a clear, structured plan. Be specific about tool names and server names."
        );

        match self.llm.invoke(&[Message::user(prompt)]).await {
            Ok(reply) => {
                let plan = framed(&reply.text());
                tracing::info!("Generated reasoning plan:\n{}", plan);
                plan
            }
            Err(e) => {
                tracing::warn!("Failed to generate reasoning plan: {}", e);
                framed(&format!(
                    "Query: {query}\n\nAvailable Tools:\n{tool_info}\n\n\
                     Note: Automatic planning failed. The agent will proceed with available tools."
                ))
            }
        }
    }
}

fn framed(body: &str) -> String {
    let rule = "=".repeat(BANNER_WIDTH);
    format!("\n{rule}\nREASONING PLAN\n{rule}\n{body}\n{rule}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Search;

    #[async_trait]
    impl Tool for Search {
        fn name(&self) -> &str {
            "search"
        }

        fn description(&self) -> &str {
            "Web search"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(String::new())
        }
    }

    fn tools() -> (Vec<CatalogTool>, BTreeMap<String, String>) {
        let tools = vec![CatalogTool::new("web", Arc::new(Search))];
        let map = BTreeMap::from([("search".to_string(), "web".to_string())]);
        (tools, map)
    }

    #[tokio::test]
    async fn test_plan_is_framed_and_normalized() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_reply(Message::assistant(crate::memory::Content::Blocks(vec![
            json!({"type": "text", "text": "1. call search"}),
        ])));
        let planner = ReasoningPlanner::new(mock.clone());
        let (tools, map) = tools();
        let plan = planner.generate("find rust news", &tools, &map).await;
        assert!(plan.contains("REASONING PLAN"));
        assert!(plan.contains("1. call search"));
        let prompt = mock.calls()[0][0].text();
        assert!(prompt.contains("User Query: find rust news"));
        assert!(prompt.contains("- search (Server: web): Web search"));
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_static_plan() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Request("boom".into()));
        let planner = ReasoningPlanner::new(mock);
        let (tools, map) = tools();
        let plan = planner.generate("find rust news", &tools, &map).await;
        assert!(plan.contains("Query: find rust news"));
        assert!(plan.contains("- search (Server: web): Web search"));
        assert!(plan.contains("Automatic planning failed"));
    }

    #[test]
    fn test_unknown_server_and_empty_tools() {
        let (tools, _) = tools();
        assert!(ReasoningPlanner::tool_info(&tools, &BTreeMap::new()).contains("(Server: unknown)"));
        assert_eq!(ReasoningPlanner::tool_info(&[], &BTreeMap::new()), "No tools available.");
    }
}
