//! 可观测性：日志初始化与运行遥测

pub mod telemetry;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use telemetry::{ExecutionRecord, NoopTelemetry, TelemetrySink, TracingTelemetry};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局 subscriber（RUST_LOG 覆盖默认 info）；重复调用会 panic，嵌入场景用 try_init
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .init();
}

/// 不 panic 的版本：已安装时返回 false
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
