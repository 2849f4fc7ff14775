use async_trait::async_trait;

use crate::{core::log_record::LogRecord, ports::log_sink::LogSink};

/// Target of the events carrying analytics records.
pub const ANALYTICS_TARGET: &str = "gatehouse::analytics";

/// Emits every record as one JSON event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn write(&self, record: LogRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => tracing::info!(target: ANALYTICS_TARGET, record = %json, "api request"),
            Err(e) => tracing::error!("Failed to serialize log record: {}", e),
        }
    }
}
