//! 服务器管理模式
//!
//! 启动时只暴露四个管理工具；模型在运行中调用 connect_to_mcp_server 后，
//! current_tools() 变为「管理工具 + 活跃服务器工具」，工具集变化交由编排器在安全点重启执行器。

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::mcp::catalog::{CatalogTool, ToolCatalog};
use crate::mcp::connector::{load_connector_tools, McpConnector};
use crate::mcp::{read_lock, write_lock};
use crate::tools::Tool;

/// 管理工具在 tool_server_map 中的来源名
pub const MANAGEMENT_SERVER: &str = "server_manager";

#[derive(Default)]
struct ManagerState {
    active: Option<String>,
    /// 已连接过的服务器工具缓存
    server_tools: BTreeMap<String, Vec<Arc<dyn Tool>>>,
}

struct Inner {
    connectors: BTreeMap<String, Arc<dyn McpConnector>>,
    state: RwLock<ManagerState>,
    disallowed: RwLock<Vec<String>>,
}

/// 服务器管理器（Clone 共享同一状态）
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Inner>,
}

impl ServerManager {
    pub fn new(connectors: Vec<Arc<dyn McpConnector>>) -> Self {
        let connectors = connectors
            .into_iter()
            .map(|c| (c.public_identifier(), c))
            .collect();
        Self {
            inner: Arc::new(Inner {
                connectors,
                state: RwLock::new(ManagerState::default()),
                disallowed: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn active_server(&self) -> Option<String> {
        read_lock(&self.inner.state).active.clone()
    }

    pub fn management_tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(ListServers(Arc::clone(&self.inner))),
            Arc::new(ConnectServer(Arc::clone(&self.inner))),
            Arc::new(GetActiveServer(Arc::clone(&self.inner))),
            Arc::new(DisconnectServer(Arc::clone(&self.inner))),
        ]
    }

    /// 连接并激活服务器，返回其工具名
    pub async fn connect_server(&self, server_name: &str) -> Result<Vec<String>, AgentError> {
        self.inner.connect(server_name).await
    }

    pub fn disconnect_server(&self) -> Option<String> {
        write_lock(&self.inner.state).active.take()
    }

    fn is_disallowed(&self, name: &str) -> bool {
        read_lock(&self.inner.disallowed).iter().any(|d| d == name)
    }
}

impl Inner {
    async fn connect(&self, server_name: &str) -> Result<Vec<String>, AgentError> {
        let connector = self.connectors.get(server_name).ok_or_else(|| {
            let available: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
            AgentError::Connector(format!(
                "Server '{}' not found. Available servers: {}",
                server_name,
                available.join(", ")
            ))
        })?;

        if !connector.is_connected() {
            connector.connect().await?;
        }
        let cached = read_lock(&self.state).server_tools.contains_key(server_name);
        if !cached {
            let tools = load_connector_tools(connector).await?;
            write_lock(&self.state).server_tools.insert(server_name.to_string(), tools);
        }

        let mut state = write_lock(&self.state);
        state.active = Some(server_name.to_string());
        let names = state
            .server_tools
            .get(server_name)
            .map(|tools| tools.iter().map(|t| t.name().to_string()).collect())
            .unwrap_or_default();
        tracing::info!(server = server_name, "Connected to MCP server");
        Ok(names)
    }
}

#[async_trait]
impl ToolCatalog for ServerManager {
    async fn initialize(&self) -> Result<(), AgentError> {
        tracing::info!(
            "Server manager mode active with {} servers: {}",
            self.inner.connectors.len(),
            self.server_identifiers().join(", ")
        );
        Ok(())
    }

    /// 管理工具 + 活动服务器的工具；禁用列表在这里即时生效
    fn current_tools(&self) -> Vec<CatalogTool> {
        let mut out: Vec<CatalogTool> = self
            .management_tools()
            .into_iter()
            .map(|t| CatalogTool::new(MANAGEMENT_SERVER, t))
            .collect();
        let state = read_lock(&self.inner.state);
        if let Some(active) = &state.active {
            if let Some(tools) = state.server_tools.get(active) {
                out.extend(
                    tools
                        .iter()
                        .filter(|t| !self.is_disallowed(t.name()))
                        .map(|t| CatalogTool::new(active.clone(), Arc::clone(t))),
                );
            }
        }
        out
    }

    async fn close(&self) -> Result<(), AgentError> {
        {
            let mut state = write_lock(&self.inner.state);
            state.active = None;
            state.server_tools.clear();
        }
        let mut first_err = None;
        for (name, connector) in &self.inner.connectors {
            if connector.is_connected() {
                if let Err(e) = connector.disconnect().await {
                    tracing::error!(server = %name, "Error during disconnect: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn server_identifiers(&self) -> Vec<String> {
        self.inner.connectors.keys().cloned().collect()
    }

    /// 管理工具 -> server_manager；活跃服务器工具 -> 活跃服务器；其余缓存工具 -> 各自服务器
    fn tool_server_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for tool in self.management_tools() {
            map.insert(tool.name().to_string(), MANAGEMENT_SERVER.to_string());
        }
        let state = read_lock(&self.inner.state);
        if let Some(active) = &state.active {
            for tool in state.server_tools.get(active).into_iter().flatten() {
                map.insert(tool.name().to_string(), active.clone());
            }
        }
        for (server, tools) in &state.server_tools {
            for tool in tools {
                map.entry(tool.name().to_string()).or_insert_with(|| server.clone());
            }
        }
        map
    }

    /// 立即生效：下一次 current_tools 即不含被禁用的工具，运行中的编排会在安全点看到工具集变化
    fn set_disallowed_tools(&self, tools: Vec<String>) {
        *write_lock(&self.inner.disallowed) = tools;
    }
}

struct ListServers(Arc<Inner>);

#[async_trait]
impl Tool for ListServers {
    fn name(&self) -> &str {
        "list_mcp_servers"
    }

    fn description(&self) -> &str {
        "Lists all available MCP (Model Context Protocol) servers that can be connected to, including the tools available for each server."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        if self.0.connectors.is_empty() {
            return Ok("No MCP servers are currently defined.".to_string());
        }
        let state = read_lock(&self.0.state);
        let mut lines = vec!["Available MCP servers:".to_string()];
        for (i, name) in self.0.connectors.keys().enumerate() {
            let marker = if state.active.as_deref() == Some(name.as_str()) {
                " (ACTIVE)"
            } else {
                ""
            };
            lines.push(format!("{}. {}{}", i + 1, name, marker));
            if let Some(tools) = state.server_tools.get(name) {
                let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
                lines.push(format!("   Tools: {}", names.join(", ")));
            }
        }
        Ok(lines.join("\n"))
    }
}

struct ConnectServer(Arc<Inner>);

#[async_trait]
impl Tool for ConnectServer {
    fn name(&self) -> &str {
        "connect_to_mcp_server"
    }

    fn description(&self) -> &str {
        "Connect to a specific MCP server to use its tools"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "server_name": { "type": "string", "description": "The name of the MCP server." }
            },
            "required": ["server_name"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let server_name = args
            .get("server_name")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'server_name'")?;
        let already_active = read_lock(&self.0.state).active.as_deref() == Some(server_name);
        if already_active {
            return Ok(format!("Already connected to MCP server '{server_name}'"));
        }
        let names = self.0.connect(server_name).await.map_err(|e| e.to_string())?;
        Ok(format!(
            "Connected to MCP server '{}'. {} tools are now available: {}",
            server_name,
            names.len(),
            names.join(", ")
        ))
    }
}

struct GetActiveServer(Arc<Inner>);

#[async_trait]
impl Tool for GetActiveServer {
    fn name(&self) -> &str {
        "get_active_mcp_server"
    }

    fn description(&self) -> &str {
        "Get the currently active MCP (Model Context Protocol) server"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        Ok(match &read_lock(&self.0.state).active {
            Some(name) => format!("Currently active MCP server: {name}"),
            None => "No MCP server is currently active. Use connect_to_mcp_server to connect to a server."
                .to_string(),
        })
    }
}

struct DisconnectServer(Arc<Inner>);

#[async_trait]
impl Tool for DisconnectServer {
    fn name(&self) -> &str {
        "disconnect_from_mcp_server"
    }

    fn description(&self) -> &str {
        "Disconnect from the currently active MCP (Model Context Protocol) server"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        Ok(match write_lock(&self.0.state).active.take() {
            Some(name) => format!("Successfully disconnected from MCP server '{name}'."),
            None => "No MCP server is currently active, so there's nothing to disconnect from.".to_string(),
        })
    }
}
