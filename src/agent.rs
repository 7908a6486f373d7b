//! MCP Agent 门面
//!
//! 在编排器之上提供两种调用形态：stream（逐个产出事件）与 run（消费到底只返回最终结果）。
//! 负责连接器生命周期（托管时自动初始化、出错或被中途丢弃时关闭）、推理计划、对话历史记账、
//! 结构化输出二次整理，以及每次运行一条遥测记录。
//! 同一 Agent 同时只允许一次运行：stream 期间独占 `&mut self`。

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_stream::{stream, try_stream};
use futures_util::StreamExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::mcp::{ConnectorCatalog, McpConnector, ServerManager, ToolCatalog};
use crate::memory::{ConversationMemory, Message};
use crate::observability::{ExecutionRecord, NoopTelemetry, TelemetrySink, TracingTelemetry};
use crate::react::{
    coerce, enhance_query, preview, AgentEvent, EventStream, ExecutorBuilder, LoadedExecutor, OutputSchema,
    ReactExecutorFactory, ReasoningPlanner, StepExecutorFactory, StreamOrchestrator, SystemPromptOptions,
    UpdateStream, DEFAULT_MAX_RESTARTS, NO_OUTPUT_GENERATED,
};

/// 被丢弃运行遗留的后台关闭任务
type PendingClose = Arc<Mutex<Option<JoinHandle<()>>>>;

/// 单次运行选项
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 覆盖 Agent 的最大步数
    pub max_steps: Option<usize>,
    /// 由本次运行托管连接器生命周期（未初始化则初始化，出错时关闭）
    pub manage_connector: bool,
    /// 替代内部对话历史
    pub external_history: Option<Vec<Message>>,
    pub output_schema: Option<OutputSchema>,
    /// 执行前生成推理计划（作为第一个事件）
    pub reasoning: bool,
    pub detect_tool_changes: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: None,
            manage_connector: true,
            external_history: None,
            output_schema: None,
            reasoning: false,
            detect_tool_changes: true,
        }
    }
}

impl RunOptions {
    pub fn with_reasoning(mut self) -> Self {
        self.reasoning = true;
        self
    }

    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_external_history(mut self, history: Vec<Message>) -> Self {
        self.external_history = Some(history);
        self
    }
}

/// 最终结果：文本或结构化对象
#[derive(Debug, Clone, PartialEq)]
pub enum FinalOutput {
    Text(String),
    Structured(Value),
}

impl FinalOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FinalOutput::Text(s) => Some(s),
            FinalOutput::Structured(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub output: FinalOutput,
    /// 本次运行调用工具的次数
    pub tools_used: usize,
}

/// 运行被中途丢弃时关闭本次运行打开的连接；
/// 关闭任务的句柄留在 pending 中，下一次 initialize / close 先等它结束
struct CleanupGuard {
    catalog: Arc<dyn ToolCatalog>,
    initialized: Arc<AtomicBool>,
    pending: PendingClose,
    armed: bool,
}

impl CleanupGuard {
    fn new(catalog: Arc<dyn ToolCatalog>, initialized: Arc<AtomicBool>, pending: PendingClose) -> Self {
        Self {
            catalog,
            initialized,
            pending,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.initialized.store(false, Ordering::SeqCst);
        let catalog = Arc::clone(&self.catalog);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::info!("Run abandoned, closing connectors");
                let task = handle.spawn(async move {
                    if let Err(e) = catalog.close().await {
                        tracing::warn!("Error closing connectors after abandoned run: {}", e);
                    }
                });
                *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
            Err(_) => tracing::warn!("Run abandoned outside a tokio runtime, connectors left open"),
        }
    }
}

/// 单次运行的记账（供遥测与清理）
#[derive(Default)]
struct RunContext {
    initialized_here: bool,
    steps: usize,
    response: Option<String>,
    guard: Option<CleanupGuard>,
}

struct RunSummary<'q> {
    method: &'static str,
    query: &'q str,
    success: bool,
    max_steps_used: Option<usize>,
    manage_connector: bool,
    external_history_used: bool,
    steps_taken: usize,
    response: Option<String>,
    started: Instant,
    error_type: Option<String>,
}

/// McpAgent 构建器
pub struct McpAgentBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    catalog: Option<Arc<dyn ToolCatalog>>,
    connectors: Vec<Arc<dyn McpConnector>>,
    use_server_manager: bool,
    factory: Option<Arc<dyn StepExecutorFactory>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    prompt: SystemPromptOptions,
    max_steps: usize,
    max_restarts: usize,
    memory_enabled: bool,
    max_context_turns: usize,
    auto_initialize: bool,
    tool_timeout_secs: u64,
}

impl Default for McpAgentBuilder {
    fn default() -> Self {
        Self {
            llm: None,
            catalog: None,
            connectors: Vec::new(),
            use_server_manager: false,
            factory: None,
            telemetry: None,
            prompt: SystemPromptOptions::default(),
            max_steps: 5,
            max_restarts: DEFAULT_MAX_RESTARTS,
            memory_enabled: true,
            max_context_turns: 20,
            auto_initialize: false,
            tool_timeout_secs: 30,
        }
    }
}

impl McpAgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以配置文件的 [agent] / [tools] / [telemetry] 段为默认值
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut builder = Self::new()
            .max_steps(cfg.agent.max_steps)
            .max_restarts(cfg.agent.max_restarts)
            .memory_enabled(cfg.agent.memory_enabled)
            .max_context_turns(cfg.agent.max_context_turns)
            .auto_initialize(cfg.agent.auto_initialize)
            .use_server_manager(cfg.agent.use_server_manager)
            .disallowed_tools(cfg.agent.disallowed_tools.clone())
            .tool_timeout_secs(cfg.tools.tool_timeout_secs);
        builder.prompt.system_prompt = cfg.agent.system_prompt.clone();
        builder.prompt.template_override = cfg.agent.system_prompt_template.clone();
        builder.prompt.additional_instructions = cfg.agent.additional_instructions.clone();
        if !cfg.telemetry.enabled {
            builder.telemetry = Some(Arc::new(NoopTelemetry));
        }
        builder
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 直接提供工具目录（优先于 connectors）
    pub fn catalog(mut self, catalog: Arc<dyn ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn McpConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn connectors(mut self, connectors: Vec<Arc<dyn McpConnector>>) -> Self {
        self.connectors.extend(connectors);
        self
    }

    pub fn use_server_manager(mut self, enabled: bool) -> Self {
        self.use_server_manager = enabled;
        self
    }

    pub fn step_executor_factory(mut self, factory: Arc<dyn StepExecutorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn memory_enabled(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn max_context_turns(mut self, turns: usize) -> Self {
        self.max_context_turns = turns;
        self
    }

    pub fn auto_initialize(mut self, enabled: bool) -> Self {
        self.auto_initialize = enabled;
        self
    }

    pub fn tool_timeout_secs(mut self, secs: u64) -> Self {
        self.tool_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt.system_prompt = Some(prompt.into());
        self
    }

    pub fn system_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt.template_override = Some(template.into());
        self
    }

    pub fn additional_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.prompt.additional_instructions = Some(instructions.into());
        self
    }

    pub fn disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.prompt.disallowed_tools = tools;
        self
    }

    /// 缺少模型或工具来源时立即返回 Config 错误
    pub fn build(self) -> Result<McpAgent, AgentError> {
        let llm = self
            .llm
            .ok_or_else(|| AgentError::Config("LLM is required to create an agent".to_string()))?;

        let catalog: Arc<dyn ToolCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None if self.use_server_manager && self.connectors.is_empty() => {
                return Err(AgentError::Config(
                    "Server manager mode requires at least one connector".to_string(),
                ))
            }
            None if self.connectors.is_empty() => {
                return Err(AgentError::Config(
                    "Either a tool catalog or at least one connector must be provided".to_string(),
                ))
            }
            None if self.use_server_manager => Arc::new(ServerManager::new(self.connectors)),
            None => Arc::new(ConnectorCatalog::from_connectors(self.connectors)),
        };
        catalog.set_disallowed_tools(self.prompt.disallowed_tools.clone());

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(ReactExecutorFactory::new(Arc::clone(&llm)).with_tool_timeout(self.tool_timeout_secs))
        });
        let mut prompt = self.prompt;
        prompt.use_server_manager = self.use_server_manager;

        let memory = if self.memory_enabled {
            ConversationMemory::new(self.max_context_turns)
        } else {
            ConversationMemory::disabled()
        };

        Ok(McpAgent {
            planner: ReasoningPlanner::new(Arc::clone(&llm)),
            llm,
            catalog,
            builder: ExecutorBuilder::new(factory, prompt, self.max_steps),
            telemetry: self.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry)),
            memory,
            max_restarts: self.max_restarts,
            auto_initialize: self.auto_initialize,
            use_server_manager: self.use_server_manager,
            loaded: None,
            initialized: Arc::new(AtomicBool::new(false)),
            pending_close: Arc::new(Mutex::new(None)),
            last_plan: None,
            last_answer: None,
            tools_used_names: Vec::new(),
        })
    }
}

/// MCP Agent
pub struct McpAgent {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<dyn ToolCatalog>,
    builder: ExecutorBuilder,
    planner: ReasoningPlanner,
    telemetry: Arc<dyn TelemetrySink>,
    memory: ConversationMemory,
    max_restarts: usize,
    auto_initialize: bool,
    use_server_manager: bool,
    loaded: Option<LoadedExecutor>,
    initialized: Arc<AtomicBool>,
    pending_close: PendingClose,
    last_plan: Option<String>,
    last_answer: Option<String>,
    tools_used_names: Vec<String>,
}

impl McpAgent {
    pub fn builder() -> McpAgentBuilder {
        McpAgentBuilder::new()
    }

    /// 连接工具来源、生成系统提示词并构建执行器
    pub async fn initialize(&mut self) -> Result<(), AgentError> {
        self.finish_pending_close().await;
        tracing::info!("Initializing MCP agent and connecting to services...");
        self.catalog.initialize().await?;
        let tools = self.catalog.current_tools();
        tracing::info!("Found {} tools across all connectors", tools.len());
        self.loaded = Some(self.builder.build(tools));
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("Agent initialization complete");
        Ok(())
    }

    /// 丢弃执行器并关闭全部连接；关闭失败也会复位状态
    pub async fn close(&mut self) -> Result<(), AgentError> {
        self.finish_pending_close().await;
        tracing::info!("Closing agent and cleaning up resources...");
        self.loaded = None;
        self.initialized.store(false, Ordering::SeqCst);
        match self.catalog.close().await {
            Ok(()) => {
                tracing::info!("Agent closed successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Error during agent closure: {}", e);
                Err(e)
            }
        }
    }

    async fn finish_pending_close(&self) {
        let task = self.pending_close.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            tracing::debug!("Waiting for connectors of an abandoned run to close");
            if let Err(e) = task.await {
                tracing::warn!("Background close of abandoned run failed: {}", e);
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && self.loaded.is_some()
    }

    pub fn get_last_plan(&self) -> Option<&str> {
        self.last_plan.as_deref()
    }

    /// 最近一次运行的自由文本回复（结构化输出失败时仍可取回）
    pub fn last_answer(&self) -> Option<&str> {
        self.last_answer.as_deref()
    }

    pub fn get_conversation_history(&self) -> &[Message] {
        self.memory.messages()
    }

    pub fn clear_conversation_history(&mut self) {
        self.memory.clear();
    }

    pub fn add_to_history(&mut self, message: Message) {
        self.memory.push(message);
    }

    pub fn get_system_message(&self) -> Option<&str> {
        self.loaded.as_ref().map(|l| l.system_prompt.as_str())
    }

    /// 设置完整系统提示词；已初始化时立即重建执行器
    pub fn set_system_message(&mut self, message: impl Into<String>) {
        self.builder.prompt.system_prompt = Some(message.into());
        if let Some(loaded) = self.loaded.take() {
            self.loaded = Some(self.builder.build(loaded.tools));
        }
    }

    /// 更新禁用工具列表。
    ///
    /// 标准模式（ConnectorCatalog）下，工具集在下次 initialize 时才过滤；
    /// 服务器管理模式（ServerManager）下立即从当前工具中剔除，运行中会在下一个安全点触发重启。
    /// 系统提示词里的工具清单随下一次执行器重建更新。
    pub fn set_disallowed_tools(&mut self, tools: Vec<String>) {
        self.catalog.set_disallowed_tools(tools.clone());
        self.builder.prompt.disallowed_tools = tools;
        if self.is_initialized() && !self.use_server_manager {
            tracing::info!("Agent already initialized. Changes will take effect on next initialization.");
        }
    }

    pub fn get_disallowed_tools(&self) -> &[String] {
        &self.builder.prompt.disallowed_tools
    }

    /// Agent 生命周期内调用过的工具名（按调用顺序）
    pub fn tools_used_names(&self) -> &[String] {
        &self.tools_used_names
    }

    pub fn tool_server_map(&self) -> BTreeMap<String, String> {
        self.catalog.tool_server_map()
    }

    /// 逐个产出事件：[Plan] -> (ToolInvoked, ToolResult)* -> FinalAnswer | StructuredAnswer
    pub fn stream(&mut self, query: impl Into<String>, options: RunOptions) -> EventStream<'_> {
        self.stream_inner(query.into(), options, true)
    }

    /// 消费 stream 到底，只返回最终结果
    pub async fn run(&mut self, query: impl Into<String>, options: RunOptions) -> Result<RunResult, AgentError> {
        let query = query.into();
        let started = Instant::now();
        let max_steps_used = options.max_steps;
        let manage_connector = options.manage_connector;
        let external_history_used = options.external_history.is_some();

        let mut output = None;
        let mut steps = 0usize;
        let mut failure = None;
        {
            let mut events = self.stream_inner(query.clone(), options, false);
            while let Some(item) = events.next().await {
                match item {
                    Ok(AgentEvent::ToolInvoked { .. }) => steps += 1,
                    Ok(AgentEvent::FinalAnswer { text }) => output = Some(FinalOutput::Text(text)),
                    Ok(AgentEvent::StructuredAnswer { value }) => output = Some(FinalOutput::Structured(value)),
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = &failure {
            tracing::error!("Error during agent execution: {}", e);
        }
        let response = match &output {
            Some(FinalOutput::Text(text)) => Some(text.clone()),
            Some(FinalOutput::Structured(value)) => Some(value.to_string()),
            None => None,
        };
        self.track(RunSummary {
            method: "run",
            query: &query,
            success: failure.is_none(),
            max_steps_used,
            manage_connector,
            external_history_used,
            steps_taken: steps,
            response,
            started,
            error_type: failure.as_ref().map(|e| e.kind().to_string()),
        });

        if let Some(e) = failure {
            return Err(e);
        }
        let output = output
            .ok_or_else(|| AgentError::Execution("stream ended without a final answer".to_string()))?;
        Ok(RunResult {
            output,
            tools_used: steps,
        })
    }

    /// 类型化结构化输出；第 2 次起用 enhance_query 重新运行
    pub async fn run_structured<T>(&mut self, query: impl Into<String>, attempts: usize) -> Result<T, AgentError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let query = query.into();
        let schema = OutputSchema::from_type::<T>();
        let attempts = attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let q = if attempt == 1 {
                query.clone()
            } else {
                enhance_query(&query, &schema)
            };
            let options = RunOptions::default().with_output_schema(schema.clone());
            let result = match self.run(q, options).await? {
                RunResult {
                    output: FinalOutput::Structured(value),
                    ..
                } => serde_json::from_value::<T>(value).map_err(|e| AgentError::StructuredOutput(e.to_string())),
                RunResult {
                    output: FinalOutput::Text(text),
                    ..
                } => Err(AgentError::StructuredOutput(format!("no structured result, agent replied: {}", text))),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!("Structured output attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AgentError::StructuredOutput("no attempt was made".to_string())))
    }

    /// 原始节点更新流：直接转发步骤执行器的 model / tools 更新，不经编排器，运行中不做重启。
    ///
    /// 运行前若工具集已变化仍会先重建执行器；连接器托管、清理守卫与遥测同 stream。
    /// 对话历史只记入本次查询与最终回复，工具调用消息不入历史。
    pub fn stream_events(&mut self, query: impl Into<String>, options: RunOptions) -> UpdateStream<'_> {
        let query = query.into();
        let s = stream! {
            let started = Instant::now();
            let mut ctx = RunContext::default();
            let mut failure = None;
            {
                let mut inner = self.run_updates(&query, &options, &mut ctx);
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(update) => {
                            yield Ok(update);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }

            if let Some(e) = &failure {
                tracing::error!("Error running query: {}", e);
            }
            self.track(RunSummary {
                method: "stream_events",
                query: &query,
                success: failure.is_none(),
                max_steps_used: options.max_steps,
                manage_connector: options.manage_connector,
                external_history_used: options.external_history.is_some(),
                steps_taken: ctx.steps,
                response: ctx.response.clone(),
                started,
                error_type: failure.as_ref().map(|e| e.kind().to_string()),
            });
            self.settle(&options, &mut ctx, failure.is_some()).await;

            if let Some(e) = failure {
                yield Err(e);
            }
        };
        Box::pin(s)
    }

    /// 外层：记录遥测并按需清理，最终事件在清理完成后才产出
    fn stream_inner(&mut self, query: String, options: RunOptions, track: bool) -> EventStream<'_> {
        let s = stream! {
            let started = Instant::now();
            let mut ctx = RunContext::default();
            let mut failure = None;
            let mut terminal = None;
            {
                let mut inner = self.run_events(&query, &options, &mut ctx);
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(ev) if ev.is_terminal() => terminal = Some(ev),
                        Ok(ev) => {
                            yield Ok(ev);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }

            if let Some(e) = &failure {
                tracing::error!("Error running query: {}", e);
            }
            if track {
                self.track(RunSummary {
                    method: "stream",
                    query: &query,
                    success: failure.is_none(),
                    max_steps_used: options.max_steps,
                    manage_connector: options.manage_connector,
                    external_history_used: options.external_history.is_some(),
                    steps_taken: ctx.steps,
                    response: ctx.response.clone(),
                    started,
                    error_type: failure.as_ref().map(|e| e.kind().to_string()),
                });
            }
            self.settle(&options, &mut ctx, failure.is_some()).await;

            match failure {
                Some(e) => {
                    yield Err(e);
                }
                None => {
                    if let Some(ev) = terminal {
                        yield Ok(ev);
                    }
                }
            }
        };
        Box::pin(s)
    }

    /// 收尾：出错时关闭本次运行打开的连接，成功时按目录策略关闭，最后解除清理守卫
    async fn settle(&mut self, options: &RunOptions, ctx: &mut RunContext, failed: bool) {
        if failed && ctx.initialized_here && options.manage_connector {
            tracing::info!("Cleaning up resources after error");
            if let Err(e) = self.close().await {
                tracing::warn!("Cleanup after error failed: {}", e);
            }
        }
        if !failed
            && options.manage_connector
            && ctx.initialized_here
            && self.is_initialized()
            && self.catalog.closes_after_run()
        {
            tracing::info!("Closing agent after stream completion");
            if let Err(e) = self.close().await {
                tracing::warn!("Closing after stream failed: {}", e);
            }
        }
        if let Some(guard) = ctx.guard.as_mut() {
            guard.disarm();
        }
    }

    /// 按需初始化（托管时挂上清理守卫），取出当前执行器
    async fn prepare_run(&mut self, options: &RunOptions, ctx: &mut RunContext) -> Result<LoadedExecutor, AgentError> {
        if !self.is_initialized() && (options.manage_connector || self.auto_initialize) {
            self.initialize().await?;
            ctx.initialized_here = true;
            if options.manage_connector {
                ctx.guard = Some(CleanupGuard::new(
                    Arc::clone(&self.catalog),
                    Arc::clone(&self.initialized),
                    Arc::clone(&self.pending_close),
                ));
            }
        }
        self.loaded_executor()
    }

    /// 外部历史或内部记忆中的 user / assistant 消息，末尾追加本次查询
    fn history_for(&self, options: &RunOptions, query: &str) -> Vec<Message> {
        let history = options
            .external_history
            .as_deref()
            .unwrap_or_else(|| self.memory.messages());
        let mut messages: Vec<Message> = history.iter().filter(|m| m.is_conversational()).cloned().collect();
        messages.push(Message::user(query));
        messages
    }

    /// 内层：初始化、计划、编排、历史记账、结构化输出
    fn run_events<'a>(&'a mut self, query: &'a str, options: &'a RunOptions, ctx: &'a mut RunContext) -> EventStream<'a> {
        let s = try_stream! {
            let mut loaded = self.prepare_run(options, ctx).await?;

            if options.reasoning {
                let plan = self
                    .planner
                    .generate(query, &loaded.tools, &self.catalog.tool_server_map())
                    .await;
                self.last_plan = Some(plan.clone());
                yield AgentEvent::Plan { text: plan };
            } else {
                self.last_plan = None;
            }

            let messages = self.history_for(options, query);
            let max_steps = options.max_steps.unwrap_or(self.builder.max_steps);
            let builder = self.builder.clone().with_max_steps(max_steps);
            if loaded.max_steps != max_steps {
                loaded = builder.build(loaded.tools.clone());
            }

            log_query(query);
            tracing::info!("Starting agent execution");

            let orchestrator = StreamOrchestrator::new(Arc::clone(&self.catalog), builder)
                .with_max_restarts(self.max_restarts)
                .with_tool_change_detection(options.detect_tool_changes);
            let mut final_text = None;
            {
                let mut events = orchestrator.execute(&mut loaded, messages);
                while let Some(ev) = events.next().await {
                    let ev = ev?;
                    match ev {
                        AgentEvent::FinalAnswer { text } => final_text = Some(text),
                        other => {
                            if let AgentEvent::ToolInvoked { tool, .. } = &other {
                                self.tools_used_names.push(tool.clone());
                                ctx.steps += 1;
                            }
                            yield other;
                        }
                    }
                }
            }
            if self.initialized.load(Ordering::SeqCst) {
                self.loaded = Some(loaded);
            }

            let answer = final_text.unwrap_or_else(|| NO_OUTPUT_GENERATED.to_string());
            let produced = answer != NO_OUTPUT_GENERATED;
            ctx.response = Some(answer.clone());
            self.last_answer = produced.then(|| answer.clone());

            self.memory.push(Message::user(query));
            if produced {
                self.memory.push(Message::assistant(answer.clone()));
            }

            match &options.output_schema {
                Some(schema) if produced => {
                    tracing::info!("Attempting structured output...");
                    let value = coerce(self.llm.as_ref(), &answer, schema).await.map_err(|e| {
                        tracing::error!("Structured output failed: {}", e);
                        e
                    })?;
                    self.memory.push(Message::assistant(format!("Structured result: {}", value)));
                    tracing::info!("Structured output successful");
                    ctx.response = Some(value.to_string());
                    yield AgentEvent::StructuredAnswer { value };
                }
                Some(_) => {
                    tracing::warn!("Structured output requested but the agent produced no answer, returning text");
                    yield AgentEvent::FinalAnswer { text: answer };
                }
                None => {
                    tracing::info!("Final answer: {}", preview(&answer));
                    yield AgentEvent::FinalAnswer { text: answer };
                }
            }
        };
        Box::pin(s)
    }

    /// stream_events 内层：转发执行器更新，按消息 id 去重计数工具调用并记账
    fn run_updates<'a>(&'a mut self, query: &'a str, options: &'a RunOptions, ctx: &'a mut RunContext) -> UpdateStream<'a> {
        let s = try_stream! {
            let mut loaded = self.prepare_run(options, ctx).await?;
            let messages = self.history_for(options, query);
            let max_steps = options.max_steps.unwrap_or(self.builder.max_steps);
            let builder = self.builder.clone().with_max_steps(max_steps);
            if loaded.max_steps != max_steps {
                loaded = builder.build(loaded.tools.clone());
            }
            if options.detect_tool_changes {
                StreamOrchestrator::new(Arc::clone(&self.catalog), builder).refresh_before_run(&mut loaded);
            }

            log_query(query);
            tracing::info!("Starting raw event stream");

            let mut seen = HashSet::new();
            let mut answer = None;
            let mut streamed_chars = 0usize;
            let mut updates = loaded.executor.stream(messages);
            while let Some(update) = updates.next().await {
                let update = update?;
                for msg in &update.messages {
                    if !seen.insert(msg.id.clone()) {
                        continue;
                    }
                    streamed_chars += msg.text().chars().count();
                    for call in &msg.tool_calls {
                        self.tools_used_names.push(call.name.clone());
                        ctx.steps += 1;
                    }
                    if msg.is_final_answer() {
                        answer = Some(msg.text());
                    }
                }
                yield update;
            }
            if self.initialized.load(Ordering::SeqCst) {
                self.loaded = Some(loaded);
            }

            ctx.response = Some(format!("[STREAMED RESPONSE - {} chars]", streamed_chars));
            self.last_answer = answer.clone();
            self.memory.push(Message::user(query));
            if let Some(answer) = answer {
                self.memory.push(Message::assistant(answer));
            }
        };
        Box::pin(s)
    }

    fn loaded_executor(&self) -> Result<LoadedExecutor, AgentError> {
        match &self.loaded {
            Some(loaded) if self.initialized.load(Ordering::SeqCst) => Ok(loaded.clone()),
            _ => Err(AgentError::NotInitialized("MCP agent failed to initialize".to_string())),
        }
    }

    fn track(&self, summary: RunSummary<'_>) {
        let tools: Vec<String> = self
            .loaded
            .as_ref()
            .map(|l| l.tools.iter().map(|t| t.name().to_string()).collect())
            .unwrap_or_default();
        let model = self.llm.model_info();
        let record = ExecutionRecord {
            timestamp: chrono::Utc::now(),
            execution_method: summary.method.to_string(),
            query: summary.query.to_string(),
            success: summary.success,
            model_provider: model.provider,
            model_name: model.name,
            server_count: self.catalog.server_count(),
            server_identifiers: self.catalog.server_identifiers(),
            total_tools_available: tools.len(),
            tools_available_names: tools,
            max_steps_configured: self.builder.max_steps,
            memory_enabled: self.memory.is_enabled(),
            use_server_manager: self.use_server_manager,
            max_steps_used: summary.max_steps_used,
            manage_connector: summary.manage_connector,
            external_history_used: summary.external_history_used,
            steps_taken: summary.steps_taken,
            tools_used_count: self.tools_used_names.len(),
            tools_used_names: self.tools_used_names.clone(),
            response: summary.response,
            execution_time_ms: summary.started.elapsed().as_millis() as u64,
            error_type: summary.error_type,
            conversation_history_length: self.memory.len(),
        };
        self.telemetry.track_execution(&record);
        tracing::info!(
            "Agent {} finished in {:.2} seconds",
            summary.method,
            summary.started.elapsed().as_secs_f64()
        );
    }
}

fn log_query(query: &str) {
    let shown: String = query.chars().take(50).collect::<String>().replace('\n', " ");
    let shown = if query.chars().count() > 50 { format!("{shown}...") } else { shown };
    tracing::info!("Received query: '{}'", shown);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::mcp::StaticConnector;
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo text"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn connector() -> Arc<dyn McpConnector> {
        let mut reg = ToolRegistry::new();
        reg.register(Echo);
        Arc::new(StaticConnector::new("echo-server", reg))
    }

    #[test]
    fn test_build_requires_llm_and_tool_source() {
        let err = McpAgent::builder().connector(connector()).build().err().unwrap();
        assert!(matches!(err, AgentError::Config(_)));

        let err = McpAgent::builder()
            .llm(Arc::new(MockLlmClient::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("connector"));

        let err = McpAgent::builder()
            .llm(Arc::new(MockLlmClient::new()))
            .use_server_manager(true)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("Server manager"));
    }

    #[test]
    fn test_from_config_seeds_knobs() {
        let mut cfg = AppConfig::default();
        cfg.agent.max_steps = 9;
        cfg.agent.memory_enabled = false;
        cfg.agent.disallowed_tools = vec!["echo".into()];
        let agent = McpAgentBuilder::from_config(&cfg)
            .llm(Arc::new(MockLlmClient::new()))
            .connector(connector())
            .build()
            .unwrap();
        assert_eq!(agent.builder.max_steps, 9);
        assert!(!agent.memory.is_enabled());
        assert_eq!(agent.get_disallowed_tools(), ["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_without_initialization_fails() {
        let mut agent = McpAgent::builder()
            .llm(Arc::new(MockLlmClient::new()))
            .connector(connector())
            .build()
            .unwrap();
        let options = RunOptions {
            manage_connector: false,
            ..RunOptions::default()
        };
        let err = agent.run("hi", options).await.unwrap_err();
        assert!(matches!(err, AgentError::NotInitialized(_)));
        assert!(agent.get_conversation_history().is_empty());
    }

    #[tokio::test]
    async fn test_set_system_message_rebuilds_executor() {
        let mut agent = McpAgent::builder()
            .llm(Arc::new(MockLlmClient::new()))
            .catalog(Arc::new(ConnectorCatalog::persistent(vec![connector()])))
            .build()
            .unwrap();
        agent.initialize().await.unwrap();
        assert!(agent.get_system_message().unwrap().contains("- echo: Echo text"));
        agent.set_system_message("Only answer in French.");
        assert_eq!(agent.get_system_message(), Some("Only answer in French."));
    }
}
