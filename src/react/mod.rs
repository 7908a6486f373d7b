//! 认知层：事件模型、运行状态、步骤执行器、系统提示词、流式编排主循环、推理计划、结构化输出

pub mod events;
pub mod loop_;
pub mod planner;
pub mod prompts;
pub mod state;
pub mod step;
pub mod structured;

pub use events::{AgentEvent, StepUpdate};
pub use loop_::{
    preview, EventStream, ExecutorBuilder, LoadedExecutor, StreamOrchestrator, DEFAULT_MAX_RESTARTS,
    NO_OUTPUT_GENERATED, UpdateStream,
};
pub use planner::ReasoningPlanner;
pub use prompts::SystemPromptOptions;
pub use state::{PendingToolCall, RunState};
pub use step::{
    parse_llm_output, ParsedOutput, ReactExecutorFactory, ReactStepExecutor, StepExecutor,
    StepExecutorFactory, StepStream, ToolCall,
};
pub use structured::{coerce, enhance_query, OutputSchema, SchemaField};
