//! MCP 层：连接器契约、工具目录、服务器管理模式

pub mod catalog;
pub mod connector;
pub mod server_manager;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use catalog::{CatalogTool, ConnectorCatalog, ToolCatalog, ToolSetSnapshot};
pub use connector::{
    load_connector_tools, McpConnector, RemotePromptSpec, RemoteResourceSpec, RemoteToolSpec,
    StaticConnector,
};
pub use server_manager::{ServerManager, MANAGEMENT_SERVER};

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
