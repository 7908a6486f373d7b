//! 运行遥测
//!
//! 每次 run / stream 产生一条 ExecutionRecord，交给 TelemetrySink；发送是即发即忘，不向调用方抛错。

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 单次运行记录
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    /// "run" 或 "stream"
    pub execution_method: String,
    pub query: String,
    pub success: bool,
    pub model_provider: String,
    pub model_name: String,
    pub server_count: usize,
    pub server_identifiers: Vec<String>,
    pub total_tools_available: usize,
    pub tools_available_names: Vec<String>,
    pub max_steps_configured: usize,
    pub memory_enabled: bool,
    pub use_server_manager: bool,
    pub max_steps_used: Option<usize>,
    pub manage_connector: bool,
    pub external_history_used: bool,
    pub steps_taken: usize,
    pub tools_used_count: usize,
    pub tools_used_names: Vec<String>,
    pub response: Option<String>,
    pub execution_time_ms: u64,
    pub error_type: Option<String>,
    pub conversation_history_length: usize,
}

pub trait TelemetrySink: Send + Sync {
    fn track_execution(&self, record: &ExecutionRecord);
}

/// 以 JSON 形式写入 tracing（target = "telemetry"）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn track_execution(&self, record: &ExecutionRecord) {
        match serde_json::to_string(record) {
            Ok(json) => tracing::info!(target: "telemetry", record = %json, "agent_execution"),
            Err(e) => tracing::warn!(target: "telemetry", "failed to serialize execution record: {}", e),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn track_execution(&self, _record: &ExecutionRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes() {
        let record = ExecutionRecord {
            timestamp: Utc::now(),
            execution_method: "run".into(),
            query: "q".into(),
            success: false,
            model_provider: "mock".into(),
            model_name: "mock-llm".into(),
            server_count: 1,
            server_identifiers: vec!["math".into()],
            total_tools_available: 1,
            tools_available_names: vec!["add".into()],
            max_steps_configured: 5,
            memory_enabled: true,
            use_server_manager: false,
            max_steps_used: None,
            manage_connector: true,
            external_history_used: false,
            steps_taken: 0,
            tools_used_count: 0,
            tools_used_names: Vec::new(),
            response: None,
            execution_time_ms: 3,
            error_type: Some("execution_error".into()),
            conversation_history_length: 0,
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["execution_method"], "run");
        assert_eq!(v["error_type"], "execution_error");
        TracingTelemetry.track_execution(&record);
        NoopTelemetry.track_execution(&record);
    }
}
