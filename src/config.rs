//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MCP_HIVE__*` 覆盖（双下划线表示嵌套，如 `MCP_HIVE__AGENT__MAX_RESTARTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub telemetry: TelemetrySection,
}

/// [agent] 段：步数、重启上限、记忆、系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单次运行内步骤执行器的最大步数
    pub max_steps: usize,
    /// 运行中工具集变化触发的最大重启次数
    pub max_restarts: usize,
    pub memory_enabled: bool,
    /// 对话历史保留轮数（0 表示不限）
    pub max_context_turns: usize,
    pub auto_initialize: bool,
    /// 服务器管理模式：只暴露管理工具，运行中按需连接服务器
    pub use_server_manager: bool,
    /// 完整系统提示词（优先于模板）
    pub system_prompt: Option<String>,
    /// 含 {tool_descriptions} 占位符的模板
    pub system_prompt_template: Option<String>,
    pub additional_instructions: Option<String>,
    pub disallowed_tools: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 5,
            max_restarts: 3,
            memory_enabled: true,
            max_context_turns: 20,
            auto_initialize: false,
            use_server_manager: false,
            system_prompt: None,
            system_prompt_template: None,
            additional_instructions: None,
            disallowed_tools: Vec::new(),
        }
    }
}

/// [llm] 段：后端与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { tool_timeout_secs: 30 }
    }
}

/// [telemetry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub enabled: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// 从 config 目录加载配置，环境变量 MCP_HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MCP_HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MCP_HIVE")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("agent.disallowed_tools")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 5);
        assert_eq!(cfg.agent.max_restarts, 3);
        assert!(cfg.agent.memory_enabled);
        assert!(cfg.telemetry.enabled);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_restarts = 7\nmemory_enabled = false\ndisallowed_tools = [\"shell\"]\n\n[llm]\nmodel = \"gpt-4o\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_restarts, 7);
        assert!(!cfg.agent.memory_enabled);
        assert_eq!(cfg.agent.disallowed_tools, vec!["shell".to_string()]);
        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.agent.max_steps, 5);
    }
}
