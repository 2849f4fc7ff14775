//! Ships records to a bulk HTTP endpoint as newline-delimited JSON.
//!
//! `write` only enqueues into a bounded channel; a background task drains it
//! into batches that are posted when `batch_size` is reached or every
//! `flush_interval`. When the queue is full the record is dropped with a
//! warning so request handling never waits on the analytics store.
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use reqwest::header::CONTENT_TYPE;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{
    config::LogSinkConfig, core::log_record::LogRecord, metrics, ports::log_sink::LogSink,
};

pub struct HttpLogSink {
    tx: mpsc::Sender<LogRecord>,
}

impl HttpLogSink {
    /// Start the background shipper. The task exits after the last sender is
    /// dropped and the remaining records are flushed.
    pub fn spawn(config: &LogSinkConfig) -> Result<(Self, JoinHandle<()>)> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| eyre!("log_sink.url is required for the http sink"))?;
        let flush_interval = humantime::parse_duration(&config.flush_interval)
            .wrap_err("Invalid log_sink.flush_interval")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build log sink HTTP client")?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shipper = Shipper {
            client,
            url,
            batch_size: config.batch_size.max(1),
        };
        let handle = tokio::spawn(shipper.run(rx, flush_interval));
        Ok((Self { tx }, handle))
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn write(&self, record: LogRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::increment_log_records_dropped();
                tracing::warn!("Log sink queue full, dropping record");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Log sink shipper stopped, dropping record");
            }
        }
    }
}

struct Shipper {
    client: reqwest::Client,
    url: String,
    batch_size: usize,
}

impl Shipper {
    async fn run(self, mut rx: mpsc::Receiver<LogRecord>, flush_interval: Duration) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        tracing::info!("Log sink shipper stopped");
                        return;
                    }
                },
                _ = ticker.tick() => self.flush(&mut batch).await,
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let body = encode_batch(batch);
        let count = batch.len();
        batch.clear();

        let result = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => tracing::debug!(count, "Shipped log records"),
            Err(e) => tracing::warn!(count, error = %e, "Failed to ship log records"),
        }
    }
}

/// One JSON document per line, newline terminated.
pub fn encode_batch(records: &[LogRecord]) -> String {
    let mut body = String::new();
    for record in records {
        match serde_json::to_string(record) {
            Ok(line) => {
                body.push_str(&line);
                body.push('\n');
            }
            Err(e) => tracing::error!("Failed to serialize log record: {}", e),
        }
    }
    body
}
