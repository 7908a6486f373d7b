//! 工具目录：当前可用工具集合（按来源服务器分组）
//!
//! 编排器只在安全点调用 `snapshot()` 比较工具名集合，必须同步且廉价；
//! `tool_server_map()` 每次从当前目录推导，不缓存。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::core::AgentError;
use crate::mcp::connector::{load_connector_tools, McpConnector};
use crate::mcp::{read_lock, write_lock};
use crate::tools::Tool;

/// 目录中的一个工具及其来源服务器
#[derive(Clone)]
pub struct CatalogTool {
    pub server: String,
    pub tool: Arc<dyn Tool>,
}

impl CatalogTool {
    pub fn new(server: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        Self {
            server: server.into(),
            tool,
        }
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn description(&self) -> &str {
        self.tool.description()
    }
}

impl fmt::Debug for CatalogTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogTool")
            .field("server", &self.server)
            .field("name", &self.name())
            .finish()
    }
}

/// 某一时刻可见的工具名集合，按集合相等比较
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolSetSnapshot(BTreeSet<String>);

impl ToolSetSnapshot {
    pub fn from_tools(tools: &[CatalogTool]) -> Self {
        Self(tools.iter().map(|t| t.name().to_string()).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ToolSetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names().collect();
        write!(f, "{}", names.join(", "))
    }
}

/// 工具目录 trait：标准模式（ConnectorCatalog）与服务器管理模式（ServerManager）
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// 建立连接并加载工具；默认无操作
    async fn initialize(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// 当前可用工具（同步、廉价）
    fn current_tools(&self) -> Vec<CatalogTool>;

    async fn close(&self) -> Result<(), AgentError>;

    fn server_identifiers(&self) -> Vec<String>;

    fn server_count(&self) -> usize {
        self.server_identifiers().len()
    }

    /// 工具名 -> 来源服务器（派生视图）
    fn tool_server_map(&self) -> BTreeMap<String, String> {
        self.current_tools()
            .into_iter()
            .map(|t| (t.name().to_string(), t.server))
            .collect()
    }

    /// 托管运行结束后是否应关闭连接
    fn closes_after_run(&self) -> bool {
        false
    }

    /// 更新禁用工具列表；ConnectorCatalog 在下次 initialize 时过滤，ServerManager 立即过滤
    fn set_disallowed_tools(&self, _tools: Vec<String>) {}

    fn snapshot(&self) -> ToolSetSnapshot {
        ToolSetSnapshot::from_tools(&self.current_tools())
    }
}

/// 标准模式目录：连接全部连接器，工具/资源/提示词统一暴露
pub struct ConnectorCatalog {
    connectors: Vec<Arc<dyn McpConnector>>,
    tools: RwLock<Vec<CatalogTool>>,
    disallowed: RwLock<Vec<String>>,
    closes_after_run: bool,
}

impl ConnectorCatalog {
    /// 托管连接器：每次托管运行结束后断开
    pub fn from_connectors(connectors: Vec<Arc<dyn McpConnector>>) -> Self {
        Self {
            connectors,
            tools: RwLock::new(Vec::new()),
            disallowed: RwLock::new(Vec::new()),
            closes_after_run: true,
        }
    }

    /// 持久会话：运行结束不断开，由调用方 close
    pub fn persistent(connectors: Vec<Arc<dyn McpConnector>>) -> Self {
        Self {
            closes_after_run: false,
            ..Self::from_connectors(connectors)
        }
    }

    pub fn with_disallowed_tools(self, tools: Vec<String>) -> Self {
        *write_lock(&self.disallowed) = tools;
        self
    }

    pub fn connectors(&self) -> &[Arc<dyn McpConnector>] {
        &self.connectors
    }
}

#[async_trait]
impl ToolCatalog for ConnectorCatalog {
    async fn initialize(&self) -> Result<(), AgentError> {
        tracing::info!("Connecting to {} direct connectors...", self.connectors.len());
        let disallowed = read_lock(&self.disallowed).clone();
        let mut loaded = Vec::new();
        for connector in &self.connectors {
            if !connector.is_connected() {
                connector.connect().await?;
            }
            let server = connector.public_identifier();
            for tool in load_connector_tools(connector).await? {
                if disallowed.iter().any(|d| d == tool.name()) {
                    tracing::debug!(tool = tool.name(), "tool disallowed, skipped");
                    continue;
                }
                loaded.push(CatalogTool::new(server.clone(), tool));
            }
        }
        tracing::info!("Created {} tools from connectors", loaded.len());
        *write_lock(&self.tools) = loaded;
        Ok(())
    }

    fn current_tools(&self) -> Vec<CatalogTool> {
        read_lock(&self.tools).clone()
    }

    /// 断开全部连接器；单个失败只记录，最后返回首个错误
    async fn close(&self) -> Result<(), AgentError> {
        write_lock(&self.tools).clear();
        let mut first_err = None;
        for connector in &self.connectors {
            tracing::info!(server = %connector.public_identifier(), "Disconnecting connector");
            if let Err(e) = connector.disconnect().await {
                tracing::error!(server = %connector.public_identifier(), "Error during disconnect: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn server_identifiers(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.public_identifier()).collect()
    }

    fn closes_after_run(&self) -> bool {
        self.closes_after_run
    }

    fn set_disallowed_tools(&self, tools: Vec<String>) {
        *write_lock(&self.disallowed) = tools;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::StaticConnector;
    use crate::tools::ToolRegistry;
    use serde_json::Value;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    fn static_connector(id: &str, names: &[&'static str]) -> Arc<dyn McpConnector> {
        let mut reg = ToolRegistry::new();
        for n in names {
            reg.register(Named(n));
        }
        Arc::new(StaticConnector::new(id, reg))
    }

    #[test]
    fn test_snapshot_set_equality_ignores_order_and_server() {
        let a = vec![
            CatalogTool::new("s1", Arc::new(Named("x"))),
            CatalogTool::new("s1", Arc::new(Named("y"))),
        ];
        let b = vec![
            CatalogTool::new("s2", Arc::new(Named("y"))),
            CatalogTool::new("s2", Arc::new(Named("x"))),
        ];
        assert_eq!(ToolSetSnapshot::from_tools(&a), ToolSetSnapshot::from_tools(&b));
        assert_eq!(ToolSetSnapshot::from_tools(&a).to_string(), "x, y");
    }

    #[tokio::test]
    async fn test_initialize_groups_tools_by_server() {
        let catalog = ConnectorCatalog::from_connectors(vec![
            static_connector("math", &["add"]),
            static_connector("text", &["upper", "lower"]),
        ]);
        assert!(catalog.current_tools().is_empty());
        catalog.initialize().await.unwrap();
        let map = catalog.tool_server_map();
        assert_eq!(map.get("add").map(String::as_str), Some("math"));
        assert_eq!(map.get("upper").map(String::as_str), Some("text"));
        assert_eq!(catalog.snapshot().len(), 3);
        assert!(catalog.closes_after_run());
    }

    #[tokio::test]
    async fn test_disallowed_tools_filtered_and_close_empties() {
        let conn = static_connector("text", &["upper", "lower"]);
        let catalog = ConnectorCatalog::persistent(vec![Arc::clone(&conn)])
            .with_disallowed_tools(vec!["lower".into()]);
        catalog.initialize().await.unwrap();
        assert!(!catalog.snapshot().contains("lower"));
        assert!(!catalog.closes_after_run());
        catalog.close().await.unwrap();
        assert!(catalog.current_tools().is_empty());
        assert!(!conn.is_connected());
    }
}
