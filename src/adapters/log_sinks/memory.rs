use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{core::log_record::LogRecord, ports::log_sink::LogSink};

/// Keeps records in process. Used by tests and by embedders that forward
/// records on their own.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
    written: Notify,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First record whose query string has `key=value`.
    pub fn find(&self, key: &str, value: &str) -> Option<LogRecord> {
        let records = self.records.lock().ok()?;
        records
            .iter()
            .find(|record| record.query_param(key) == Some(value))
            .cloned()
    }

    /// Wait up to `timeout` for a record whose query string has `key=value`.
    pub async fn wait_for(&self, key: &str, value: &str, timeout: Duration) -> Option<LogRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let written = self.written.notified();
            tokio::pin!(written);
            written.as_mut().enable();

            if let Some(record) = self.find(key, value) {
                return Some(record);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, written).await.is_err() {
                return self.find(key, value);
            }
        }
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, record: LogRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(e) => {
                tracing::error!("Memory log sink lock poisoned: {}", e);
                return;
            }
        }
        self.written.notify_waiters();
    }
}
