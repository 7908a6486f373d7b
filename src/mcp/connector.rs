//! MCP 连接器契约与适配
//!
//! McpConnector 描述核心对远端 MCP 服务器的全部依赖：连接/断开、枚举工具/资源/提示词、调用。
//! 远端的工具、资源、提示词统一适配为 Tool，进入步骤执行器；StaticConnector 为进程内实现（测试与本地工具）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{Tool, ToolRegistry};

/// 远端工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 远端资源描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResourceSpec {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub description: String,
}

/// 远端提示词描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePromptSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// MCP 协议客户端契约
#[async_trait]
pub trait McpConnector: Send + Sync {
    /// 服务器标识（遥测、工具来源标注）
    fn public_identifier(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), AgentError>;

    async fn disconnect(&self) -> Result<(), AgentError>;

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, AgentError>;

    async fn list_resources(&self) -> Result<Vec<RemoteResourceSpec>, AgentError> {
        Ok(Vec::new())
    }

    async fn list_prompts(&self) -> Result<Vec<RemotePromptSpec>, AgentError> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, AgentError>;

    async fn read_resource(&self, uri: &str) -> Result<String, AgentError> {
        Err(AgentError::Connector(format!("resource not supported: {uri}")))
    }

    async fn get_prompt(&self, name: &str, _args: Value) -> Result<String, AgentError> {
        Err(AgentError::Connector(format!("prompt not supported: {name}")))
    }
}

/// 远端工具适配为 Tool
pub struct RemoteTool {
    connector: Arc<dyn McpConnector>,
    spec: RemoteToolSpec,
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.connector
            .call_tool(&self.spec.name, args)
            .await
            .map_err(|e| e.to_string())
    }
}

/// 资源适配为无参工具：调用即读取资源内容
pub struct ResourceTool {
    connector: Arc<dyn McpConnector>,
    spec: RemoteResourceSpec,
    description: String,
}

#[async_trait]
impl Tool for ResourceTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.connector
            .read_resource(&self.spec.uri)
            .await
            .map_err(|e| e.to_string())
    }
}

/// 提示词适配为工具：参数原样转交 get_prompt
pub struct PromptTool {
    connector: Arc<dyn McpConnector>,
    spec: RemotePromptSpec,
}

#[async_trait]
impl Tool for PromptTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "additionalProperties": true })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.connector
            .get_prompt(&self.spec.name, args)
            .await
            .map_err(|e| e.to_string())
    }
}

/// 枚举连接器的工具、资源、提示词并适配为 Tool（顺序：工具 -> 资源 -> 提示词）
pub async fn load_connector_tools(connector: &Arc<dyn McpConnector>) -> Result<Vec<Arc<dyn Tool>>, AgentError> {
    let mut out: Vec<Arc<dyn Tool>> = Vec::new();
    for spec in connector.list_tools().await? {
        out.push(Arc::new(RemoteTool {
            connector: Arc::clone(connector),
            spec,
        }));
    }
    for spec in connector.list_resources().await? {
        let description = if spec.description.is_empty() {
            format!("Return the content of the resource located at URI {}.", spec.uri)
        } else {
            spec.description.clone()
        };
        out.push(Arc::new(ResourceTool {
            connector: Arc::clone(connector),
            spec,
            description,
        }));
    }
    for spec in connector.list_prompts().await? {
        out.push(Arc::new(PromptTool {
            connector: Arc::clone(connector),
            spec,
        }));
    }
    Ok(out)
}

/// 进程内连接器：工具来自 ToolRegistry，资源与提示词为静态文本
pub struct StaticConnector {
    id: String,
    registry: ToolRegistry,
    resources: Vec<(RemoteResourceSpec, String)>,
    prompts: Vec<(RemotePromptSpec, String)>,
    connected: AtomicBool,
}

impl StaticConnector {
    pub fn new(id: impl Into<String>, registry: ToolRegistry) -> Self {
        Self {
            id: id.into(),
            registry,
            resources: Vec::new(),
            prompts: Vec::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_resource(mut self, spec: RemoteResourceSpec, content: impl Into<String>) -> Self {
        self.resources.push((spec, content.into()));
        self
    }

    pub fn with_prompt(mut self, spec: RemotePromptSpec, text: impl Into<String>) -> Self {
        self.prompts.push((spec, text.into()));
        self
    }

    fn ensure_connected(&self) -> Result<(), AgentError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AgentError::Connector(format!("{} is not connected", self.id)))
        }
    }
}

#[async_trait]
impl McpConnector for StaticConnector {
    fn public_identifier(&self) -> String {
        self.id.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), AgentError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(server = %self.id, "static connector connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, AgentError> {
        self.ensure_connected()?;
        Ok(self
            .registry
            .tools()
            .into_iter()
            .map(|t| RemoteToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<RemoteResourceSpec>, AgentError> {
        self.ensure_connected()?;
        Ok(self.resources.iter().map(|(spec, _)| spec.clone()).collect())
    }

    async fn list_prompts(&self) -> Result<Vec<RemotePromptSpec>, AgentError> {
        self.ensure_connected()?;
        Ok(self.prompts.iter().map(|(spec, _)| spec.clone()).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, AgentError> {
        self.ensure_connected()?;
        self.registry
            .execute(name, args)
            .await
            .map_err(AgentError::ToolExecutionFailed)
    }

    async fn read_resource(&self, uri: &str) -> Result<String, AgentError> {
        self.ensure_connected()?;
        self.resources
            .iter()
            .find(|(spec, _)| spec.uri == uri)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| AgentError::Connector(format!("unknown resource: {uri}")))
    }

    async fn get_prompt(&self, name: &str, _args: Value) -> Result<String, AgentError> {
        self.ensure_connected()?;
        self.prompts
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(_, text)| text.clone())
            .ok_or_else(|| AgentError::Connector(format!("unknown prompt: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Add;

    #[async_trait]
    impl Tool for Add {
        fn name(&self) -> &str {
            "add"
        }

        fn description(&self) -> &str {
            "Add two numbers"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            let a = args.get("a").and_then(Value::as_i64).ok_or("missing a")?;
            let b = args.get("b").and_then(Value::as_i64).ok_or("missing b")?;
            Ok((a + b).to_string())
        }
    }

    fn connector() -> Arc<dyn McpConnector> {
        let mut reg = ToolRegistry::new();
        reg.register(Add);
        Arc::new(
            StaticConnector::new("math", reg)
                .with_resource(
                    RemoteResourceSpec {
                        name: "readme".into(),
                        uri: "file:///readme".into(),
                        description: String::new(),
                    },
                    "hello",
                )
                .with_prompt(
                    RemotePromptSpec {
                        name: "greet".into(),
                        description: "Greeting prompt".into(),
                    },
                    "Say hi",
                ),
        )
    }

    #[tokio::test]
    async fn test_listing_requires_connection() {
        let c = connector();
        assert!(c.list_tools().await.is_err());
        c.connect().await.unwrap();
        assert_eq!(c.list_tools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_adapts_tools_resources_prompts() {
        let c = connector();
        c.connect().await.unwrap();
        let tools = load_connector_tools(&c).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["add", "readme", "greet"]);
        assert!(tools[1].description().contains("file:///readme"));
        assert_eq!(tools[0].execute(json!({"a": 10, "b": 20})).await.unwrap(), "30");
        assert_eq!(tools[1].execute(json!({})).await.unwrap(), "hello");
        assert_eq!(tools[2].execute(json!({})).await.unwrap(), "Say hi");
    }

    #[tokio::test]
    async fn test_remote_tool_error_is_string() {
        let c = connector();
        c.connect().await.unwrap();
        let tools = load_connector_tools(&c).await.unwrap();
        let err = tools[0].execute(json!({"a": 1})).await.unwrap_err();
        assert!(err.contains("missing b"));
    }
}
