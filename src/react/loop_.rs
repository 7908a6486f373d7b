//! 流式编排主循环（中断-重启）
//!
//! 驱动步骤执行器，累积消息并按 call_id 配对工具调用与结果，向调用方输出统一事件流：
//! ToolInvoked -> ToolResult（一一配对）-> 唯一的 FinalAnswer。
//! 工具集可能在运行中变化（如服务器管理模式下连接了新服务器）：只在安全点比较快照，
//! 即某次节点更新解析了工具结果且不再有挂起调用时；变化则用新工具集重建执行器，
//! 以已累积消息为起点重新开始流。重启次数有上限，耗尽后只记录日志并沿用当前执行器。

use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};

use crate::core::AgentError;
use crate::mcp::{CatalogTool, ToolCatalog, ToolSetSnapshot};
use crate::memory::{Message, Role};
use crate::react::events::{AgentEvent, StepUpdate};
use crate::react::prompts::SystemPromptOptions;
use crate::react::state::RunState;
use crate::react::step::{StepExecutor, StepExecutorFactory};

/// 没有候选最终回复时的占位文本
pub const NO_OUTPUT_GENERATED: &str = "No output generated";

/// 默认最大重启次数
pub const DEFAULT_MAX_RESTARTS: usize = 3;

/// 日志预览最大字符数
const PREVIEW_CHARS: usize = 100;

pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<AgentEvent, AgentError>> + Send + 'a>>;

/// 原始节点更新流（McpAgent::stream_events）
pub type UpdateStream<'a> = Pin<Box<dyn Stream<Item = Result<StepUpdate, AgentError>> + Send + 'a>>;

/// 截断到 100 字符并压平换行，用于日志
pub fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > PREVIEW_CHARS {
        format!("{}...", flat.chars().take(PREVIEW_CHARS - 3).collect::<String>())
    } else {
        flat
    }
}

/// 用某一工具集构建好的执行器，连同构建时的快照与系统提示词
#[derive(Clone)]
pub struct LoadedExecutor {
    pub executor: Arc<dyn StepExecutor>,
    pub snapshot: ToolSetSnapshot,
    pub tools: Vec<CatalogTool>,
    pub system_prompt: String,
    pub max_steps: usize,
}

/// 工具集 -> 系统提示词 -> 执行器
#[derive(Clone)]
pub struct ExecutorBuilder {
    factory: Arc<dyn StepExecutorFactory>,
    pub prompt: SystemPromptOptions,
    pub max_steps: usize,
}

impl ExecutorBuilder {
    pub fn new(factory: Arc<dyn StepExecutorFactory>, prompt: SystemPromptOptions, max_steps: usize) -> Self {
        Self {
            factory,
            prompt,
            max_steps,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn build(&self, tools: Vec<CatalogTool>) -> LoadedExecutor {
        tracing::debug!("Creating new agent with {} tools", tools.len());
        let system_prompt = self.prompt.build(&tools);
        let snapshot = ToolSetSnapshot::from_tools(&tools);
        let executor = self
            .factory
            .build(tools.clone(), system_prompt.clone(), self.max_steps);
        LoadedExecutor {
            executor,
            snapshot,
            tools,
            system_prompt,
            max_steps: self.max_steps,
        }
    }
}

/// 编排器：单次逻辑查询的事件流
pub struct StreamOrchestrator {
    catalog: Arc<dyn ToolCatalog>,
    builder: ExecutorBuilder,
    max_restarts: usize,
    detect_tool_changes: bool,
}

impl StreamOrchestrator {
    pub fn new(catalog: Arc<dyn ToolCatalog>, builder: ExecutorBuilder) -> Self {
        Self {
            catalog,
            builder,
            max_restarts: DEFAULT_MAX_RESTARTS,
            detect_tool_changes: true,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_tool_change_detection(mut self, enabled: bool) -> Self {
        self.detect_tool_changes = enabled;
        self
    }

    /// 工具集与 loaded 构建时不同则返回当前工具
    fn changed_tools(&self, loaded: &LoadedExecutor) -> Option<(Vec<CatalogTool>, ToolSetSnapshot)> {
        let current = self.catalog.current_tools();
        let snapshot = ToolSetSnapshot::from_tools(&current);
        (snapshot != loaded.snapshot).then_some((current, snapshot))
    }

    /// 运行前检查工具集变化，不计入重启次数；返回是否重建
    pub fn refresh_before_run(&self, loaded: &mut LoadedExecutor) -> bool {
        if !self.detect_tool_changes {
            return false;
        }
        match self.changed_tools(loaded) {
            Some((tools, snapshot)) => {
                tracing::info!("Tools changed before execution, updating agent. New tools: {}", snapshot);
                *loaded = self.builder.build(tools);
                true
            }
            None => false,
        }
    }

    /// 以 messages（历史 + 本次查询）为起点执行；重建后的执行器写回 loaded
    pub fn execute<'a>(&'a self, loaded: &'a mut LoadedExecutor, messages: Vec<Message>) -> EventStream<'a> {
        let s = try_stream! {
            let mut state = RunState::new(messages);
            self.refresh_before_run(loaded);
            let mut exhaustion_logged = false;

            loop {
                let mut restart = false;
                let mut updates = loaded.executor.stream(state.messages().to_vec());

                while let Some(update) = updates.next().await {
                    let update = update?;
                    tracing::debug!(node = %update.node, "node output: {} messages", update.messages.len());
                    let mut resolved_any = false;

                    for msg in &update.messages {
                        if !state.accumulate(msg) {
                            continue;
                        }

                        if !msg.tool_calls.is_empty() {
                            let log = msg.log_text();
                            for call in &msg.tool_calls {
                                if !state.register_call(call, &log) {
                                    continue;
                                }
                                state.steps += 1;
                                tracing::info!("Tool call: {} with input: {}", call.name, preview(&call.args.to_string()));
                                yield AgentEvent::ToolInvoked {
                                    tool: call.name.clone(),
                                    args: call.args.clone(),
                                    call_id: call.id.clone(),
                                    log: log.clone(),
                                };
                            }
                        }

                        if msg.role == Role::Tool {
                            let observation = msg.text();
                            let resolved = msg
                                .tool_call_id
                                .as_deref()
                                .and_then(|id| state.resolve(id).map(|p| (id.to_string(), p)));
                            if let Some((call_id, pending)) = resolved {
                                resolved_any = true;
                                tracing::info!("Tool result: {}", preview(&observation));
                                yield AgentEvent::ToolResult {
                                    tool: pending.name,
                                    args: pending.args,
                                    call_id,
                                    observation,
                                };
                            }
                        }

                        if msg.is_final_answer() {
                            state.set_final_answer(msg.text());
                            tracing::info!("Agent finished with output");
                        }
                    }

                    // 安全点：本次更新解析了工具结果且无挂起调用
                    if !(self.detect_tool_changes && resolved_any && !state.has_pending()) {
                        continue;
                    }
                    let Some((tools, snapshot)) = self.changed_tools(loaded) else {
                        continue;
                    };
                    if state.restarts < self.max_restarts {
                        tracing::info!("Tools changed during execution. New tools: {}", snapshot);
                        *loaded = self.builder.build(tools);
                        state.restarts += 1;
                        tracing::info!(
                            "Restarting execution with updated tools (restart {}/{})",
                            state.restarts,
                            self.max_restarts
                        );
                        restart = true;
                        break;
                    } else if !exhaustion_logged {
                        tracing::warn!("Max restarts ({}) reached. Continuing with current tools.", self.max_restarts);
                        exhaustion_logged = true;
                    }
                }

                if !restart {
                    break;
                }
            }

            let text = state
                .final_answer()
                .map(str::to_string)
                .unwrap_or_else(|| NO_OUTPUT_GENERATED.to_string());
            yield AgentEvent::FinalAnswer { text };
        };
        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::react::events::StepUpdate;
    use crate::react::step::{ReactExecutorFactory, StepStream};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 按脚本输出固定节点更新的执行器
    struct ScriptedExecutor(Vec<StepUpdate>);

    impl StepExecutor for ScriptedExecutor {
        fn stream(&self, _messages: Vec<Message>) -> StepStream {
            let updates: Vec<Result<StepUpdate, AgentError>> = self.0.iter().cloned().map(Ok).collect();
            Box::pin(futures_util::stream::iter(updates))
        }
    }

    struct ScriptedFactory(Vec<StepUpdate>);

    impl StepExecutorFactory for ScriptedFactory {
        fn build(&self, _tools: Vec<CatalogTool>, _prompt: String, _max_steps: usize) -> Arc<dyn StepExecutor> {
            Arc::new(ScriptedExecutor(self.0.clone()))
        }
    }

    /// 记录每次构建时的系统提示词
    struct CountingFactory {
        inner: ReactExecutorFactory,
        prompts: Mutex<Vec<String>>,
    }

    impl StepExecutorFactory for CountingFactory {
        fn build(&self, tools: Vec<CatalogTool>, prompt: String, max_steps: usize) -> Arc<dyn StepExecutor> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.inner.build(tools, prompt, max_steps)
        }
    }

    /// 工具集随 flap 工具调用次数变化的目录
    struct FlappingCatalog {
        version: Arc<AtomicUsize>,
    }

    struct Flap(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for Flap {
        fn name(&self) -> &str {
            "flap"
        }

        fn description(&self) -> &str {
            "changes the tool set"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(format!("v{}", self.0.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    struct Marker(String);

    #[async_trait]
    impl Tool for Marker {
        fn name(&self) -> &str {
            &self.0
        }

        fn description(&self) -> &str {
            "marker"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl ToolCatalog for FlappingCatalog {
        fn current_tools(&self) -> Vec<CatalogTool> {
            let v = self.version.load(Ordering::SeqCst);
            vec![
                CatalogTool::new("s", Arc::new(Flap(Arc::clone(&self.version)))),
                CatalogTool::new("s", Arc::new(Marker(format!("marker_v{v}")))),
            ]
        }

        async fn close(&self) -> Result<(), AgentError> {
            Ok(())
        }

        fn server_identifiers(&self) -> Vec<String> {
            vec!["s".into()]
        }
    }

    async fn collect(stream: EventStream<'_>) -> Vec<AgentEvent> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_replayed_messages_emit_events_once() {
        let call = crate::memory::ToolCallRequest::with_id("c1", "add", json!({"a": 1}));
        let invocation = Message::assistant_with_tool_calls("thinking", vec![call]);
        let result = Message::tool_result("c1", "2");
        let answer = Message::assistant("2");
        let factory = ScriptedFactory(vec![
            StepUpdate::new("model", vec![invocation.clone()]),
            StepUpdate::new("tools", vec![result.clone()]),
            StepUpdate::new("model", vec![invocation, result, answer]),
        ]);
        let catalog: Arc<dyn ToolCatalog> = Arc::new(FlappingCatalog {
            version: Arc::new(AtomicUsize::new(0)),
        });
        let builder = ExecutorBuilder::new(Arc::new(factory), SystemPromptOptions::default(), 5);
        let mut loaded = builder.build(catalog.current_tools());
        let orch = StreamOrchestrator::new(catalog, builder);
        let events = collect(orch.execute(&mut loaded, vec![Message::user("q")])).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], AgentEvent::ToolInvoked { call_id, log, .. } if call_id == "c1" && log == "thinking"));
        assert!(matches!(&events[1], AgentEvent::ToolResult { tool, observation, .. } if tool == "add" && observation == "2"));
        assert_eq!(events[2], AgentEvent::FinalAnswer { text: "2".into() });
    }

    #[tokio::test]
    async fn test_no_final_message_yields_sentinel() {
        let factory = ScriptedFactory(Vec::new());
        let catalog: Arc<dyn ToolCatalog> = Arc::new(FlappingCatalog {
            version: Arc::new(AtomicUsize::new(0)),
        });
        let builder = ExecutorBuilder::new(Arc::new(factory), SystemPromptOptions::default(), 5);
        let mut loaded = builder.build(catalog.current_tools());
        let orch = StreamOrchestrator::new(catalog, builder);
        let events = collect(orch.execute(&mut loaded, vec![Message::user("q")])).await;
        assert_eq!(events, vec![AgentEvent::FinalAnswer { text: NO_OUTPUT_GENERATED.into() }]);
    }

    #[tokio::test]
    async fn test_restarts_bounded_and_run_completes() {
        let flap = || Message::assistant("{\"tool\": \"flap\", \"args\": {}}");
        let llm = Arc::new(MockLlmClient::with_replies([flap(), flap(), flap(), Message::assistant("done")]));
        let factory = Arc::new(CountingFactory {
            inner: ReactExecutorFactory::new(llm.clone()),
            prompts: Mutex::new(Vec::new()),
        });
        let catalog: Arc<dyn ToolCatalog> = Arc::new(FlappingCatalog {
            version: Arc::new(AtomicUsize::new(0)),
        });
        let builder = ExecutorBuilder::new(factory.clone(), SystemPromptOptions::default(), 10);
        let mut loaded = builder.build(catalog.current_tools());
        let orch = StreamOrchestrator::new(catalog, builder).with_max_restarts(2);
        let events = collect(orch.execute(&mut loaded, vec![Message::user("q")])).await;

        let invoked = events.iter().filter(|e| matches!(e, AgentEvent::ToolInvoked { .. })).count();
        let results = events.iter().filter(|e| matches!(e, AgentEvent::ToolResult { .. })).count();
        assert_eq!((invoked, results), (3, 3));
        assert_eq!(events.last(), Some(&AgentEvent::FinalAnswer { text: "done".into() }));

        // 初始构建 + 2 次重启
        let prompts = factory.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("marker_v1"));
        assert!(prompts[2].contains("marker_v2"));
        assert!(loaded.snapshot.contains("marker_v2"));

        // 重启后的执行器以全部已累积消息为起点
        let calls = llm.calls();
        assert_eq!(calls[1].len(), 4);
    }

    #[tokio::test]
    async fn test_tools_changed_between_runs_rebuild_without_using_restarts() {
        let flap = || Message::assistant("{\"tool\": \"flap\", \"args\": {}}");
        let llm = Arc::new(MockLlmClient::with_replies([flap(), Message::assistant("done")]));
        let factory = Arc::new(CountingFactory {
            inner: ReactExecutorFactory::new(llm),
            prompts: Mutex::new(Vec::new()),
        });
        let version = Arc::new(AtomicUsize::new(0));
        let catalog: Arc<dyn ToolCatalog> = Arc::new(FlappingCatalog {
            version: Arc::clone(&version),
        });
        let builder = ExecutorBuilder::new(factory.clone(), SystemPromptOptions::default(), 10);
        let mut loaded = builder.build(catalog.current_tools());
        // 两次运行之间工具集已变化
        version.store(5, Ordering::SeqCst);

        let orch = StreamOrchestrator::new(catalog, builder).with_max_restarts(1);
        let events = collect(orch.execute(&mut loaded, vec![Message::user("q")])).await;
        assert_eq!(events.last(), Some(&AgentEvent::FinalAnswer { text: "done".into() }));

        // 初始构建 + 运行前重建 + 运行中 1 次重启
        let prompts = factory.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("marker_v5"));
        assert!(prompts[2].contains("marker_v6"));
        assert!(loaded.snapshot.contains("marker_v6"));
    }

    #[tokio::test]
    async fn test_detection_disabled_never_restarts() {
        let flap = || Message::assistant("{\"tool\": \"flap\", \"args\": {}}");
        let llm = Arc::new(MockLlmClient::with_replies([flap(), Message::assistant("ok")]));
        let factory = Arc::new(CountingFactory {
            inner: ReactExecutorFactory::new(llm),
            prompts: Mutex::new(Vec::new()),
        });
        let catalog: Arc<dyn ToolCatalog> = Arc::new(FlappingCatalog {
            version: Arc::new(AtomicUsize::new(0)),
        });
        let builder = ExecutorBuilder::new(factory.clone(), SystemPromptOptions::default(), 10);
        let mut loaded = builder.build(catalog.current_tools());
        let orch = StreamOrchestrator::new(catalog, builder).with_tool_change_detection(false);
        let events = collect(orch.execute(&mut loaded, vec![Message::user("q")])).await;
        assert_eq!(events.last(), Some(&AgentEvent::FinalAnswer { text: "ok".into() }));
        assert_eq!(factory.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_preview_truncates_and_flattens() {
        assert_eq!(preview("a\nb"), "a b");
        let long = "x".repeat(150);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 100);
        assert!(p.ends_with("..."));
    }
}
