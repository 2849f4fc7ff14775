use async_trait::async_trait;

use crate::core::log_record::LogRecord;

/// Destination for finished analytics records.
///
/// Implementations take ownership of the record and must not hold up the
/// response path: slow transports buffer and ship in the background.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, record: LogRecord);
}
