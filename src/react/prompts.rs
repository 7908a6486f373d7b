//! 系统提示词模板
//!
//! 优先级：用户提供的完整提示词 > 模板（自定义或默认；服务器管理模式用专用模板）。
//! 模板中的 `{tool_descriptions}` 替换为 `- name: description` 列表（排除禁用工具），末尾追加附加说明。

use crate::mcp::CatalogTool;

pub const TOOL_DESCRIPTIONS_PLACEHOLDER: &str = "{tool_descriptions}";

pub const DEFAULT_SYSTEM_PROMPT_TEMPLATE: &str = "You are a helpful AI assistant.
You have access to the following tools:

{tool_descriptions}

Use these tools when they help answer the user's request. \
Call one tool at a time, read its result, and continue until you can give a complete answer. \
When you have the answer, reply in plain text without calling a tool.";

pub const SERVER_MANAGER_SYSTEM_PROMPT_TEMPLATE: &str = "You are a helpful assistant designed to interact with MCP \
(Model Context Protocol) servers. You can manage connections to different servers and use the tools provided by the \
currently active server.

Important: The available tools change depending on which server is active.
If a request requires tools not listed below (e.g., file operations, web browsing, image manipulation), \
you MUST first connect to the appropriate server using 'connect_to_mcp_server'.
Use 'list_mcp_servers' to find the relevant server if you are unsure.
Only after successfully connecting and seeing the new tools listed in the response should you attempt to use those \
server-specific tools.
Before attempting a task that requires specific tools, you should ensure you are connected to the correct server \
and aware of its available tools. If unsure, use 'list_mcp_servers' to see the options or \
'get_active_mcp_server' to check the current connection.

When you connect to a server using 'connect_to_mcp_server', you will be informed about the new tools that become \
available. You can then use these server-specific tools in subsequent steps.

Here are the tools *currently* available to you (this list includes server management tools and will change when \
you connect to a server):
{tool_descriptions}
";

/// 构建系统提示词所需的全部选项
#[derive(Debug, Clone, Default)]
pub struct SystemPromptOptions {
    /// 完整提示词，设置后忽略模板
    pub system_prompt: Option<String>,
    pub template_override: Option<String>,
    pub use_server_manager: bool,
    pub disallowed_tools: Vec<String>,
    pub additional_instructions: Option<String>,
}

impl SystemPromptOptions {
    pub fn build(&self, tools: &[CatalogTool]) -> String {
        if let Some(prompt) = &self.system_prompt {
            return prompt.clone();
        }
        let template = if self.use_server_manager {
            SERVER_MANAGER_SYSTEM_PROMPT_TEMPLATE
        } else {
            self.template_override
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT_TEMPLATE)
        };
        let descriptions = tools
            .iter()
            .filter(|t| !self.disallowed_tools.iter().any(|d| d == t.name()))
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = template.replace(TOOL_DESCRIPTIONS_PLACEHOLDER, &descriptions);
        if let Some(extra) = &self.additional_instructions {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    struct T(&'static str);

    #[async_trait]
    impl Tool for T {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "does things"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(String::new())
        }
    }

    fn tools() -> Vec<CatalogTool> {
        vec![
            CatalogTool::new("s", Arc::new(T("add"))),
            CatalogTool::new("s", Arc::new(T("shell"))),
        ]
    }

    #[test]
    fn test_default_template_lists_allowed_tools() {
        let opts = SystemPromptOptions {
            disallowed_tools: vec!["shell".into()],
            additional_instructions: Some("Be brief.".into()),
            ..Default::default()
        };
        let prompt = opts.build(&tools());
        assert!(prompt.contains("- add: does things"));
        assert!(!prompt.contains("shell"));
        assert!(prompt.ends_with("\n\nBe brief."));
        assert!(!prompt.contains(TOOL_DESCRIPTIONS_PLACEHOLDER));
    }

    #[test]
    fn test_user_prompt_wins() {
        let opts = SystemPromptOptions {
            system_prompt: Some("Custom".into()),
            use_server_manager: true,
            ..Default::default()
        };
        assert_eq!(opts.build(&tools()), "Custom");
    }

    #[test]
    fn test_server_manager_template() {
        let opts = SystemPromptOptions {
            use_server_manager: true,
            template_override: Some("ignored {tool_descriptions}".into()),
            ..Default::default()
        };
        let prompt = opts.build(&tools());
        assert!(prompt.contains("connect_to_mcp_server"));
        assert!(prompt.contains("- add: does things"));
    }
}
