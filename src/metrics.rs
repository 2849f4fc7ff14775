//! Lightweight metrics helpers for Gatehouse.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. No exporter is embedded; the
//! application can install any compatible recorder.
//!
//! Provided metrics (labels vary by family):
//! * `gatehouse_requests_total` (counter)
//! * `gatehouse_request_duration_seconds` (histogram)
//! * `gatehouse_backend_requests_total` (counter)
//! * `gatehouse_backend_request_duration_seconds` (histogram)
//! * `gatehouse_backend_connect_failures_total` (counter)
//! * `gatehouse_gatekeeper_denials_total` (counter)
//! * `gatehouse_cache_results_total` (counter)
//! * `gatehouse_active_requests` (gauge)
//! * `gatehouse_log_records_dropped_total` (counter)
//!
//! The `*Timer` structs record durations on `Drop`, so early returns are
//! still measured.
use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant},
};

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

pub const GATEHOUSE_REQUESTS_TOTAL: &str = "gatehouse_requests_total";
pub const GATEHOUSE_REQUEST_DURATION_SECONDS: &str = "gatehouse_request_duration_seconds";
pub const GATEHOUSE_BACKEND_REQUESTS_TOTAL: &str = "gatehouse_backend_requests_total";
pub const GATEHOUSE_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "gatehouse_backend_request_duration_seconds";
pub const GATEHOUSE_BACKEND_CONNECT_FAILURES_TOTAL: &str = "gatehouse_backend_connect_failures_total";
pub const GATEHOUSE_GATEKEEPER_DENIALS_TOTAL: &str = "gatehouse_gatekeeper_denials_total";
pub const GATEHOUSE_CACHE_RESULTS_TOTAL: &str = "gatehouse_cache_results_total";
pub const GATEHOUSE_ACTIVE_REQUESTS: &str = "gatehouse_active_requests";
pub const GATEHOUSE_LOG_RECORDS_DROPPED_TOTAL: &str = "gatehouse_log_records_dropped_total";

/// In-flight request count backing the active requests gauge.
pub static ACTIVE_REQUESTS: Lazy<AtomicI64> = Lazy::new(|| {
    describe_counter!(
        GATEHOUSE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests that reached the routing stage."
    );
    describe_histogram!(
        GATEHOUSE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        GATEHOUSE_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to backend servers."
    );
    describe_histogram!(
        GATEHOUSE_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to backend servers."
    );
    describe_counter!(
        GATEHOUSE_BACKEND_CONNECT_FAILURES_TOTAL,
        Unit::Count,
        "Backend servers that could not be connected to."
    );
    describe_counter!(
        GATEHOUSE_GATEKEEPER_DENIALS_TOTAL,
        Unit::Count,
        "Requests denied by the gatekeeper, by denial code."
    );
    describe_counter!(
        GATEHOUSE_CACHE_RESULTS_TOTAL,
        Unit::Count,
        "Response cache lookups by result."
    );
    describe_gauge!(
        GATEHOUSE_ACTIVE_REQUESTS,
        "Number of requests currently inside the pipeline."
    );
    describe_counter!(
        GATEHOUSE_LOG_RECORDS_DROPPED_TOTAL,
        Unit::Count,
        "Analytics records dropped because the sink queue was full."
    );
    AtomicI64::new(0)
});

/// Increment the total request counter for a completed pipeline pass.
pub fn increment_request_total(api: &str, method: &str, status: u16) {
    counter!(
        GATEHOUSE_REQUESTS_TOTAL,
        "api" => api.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(api: &str, method: &str, duration: Duration) {
    histogram!(
        GATEHOUSE_REQUEST_DURATION_SECONDS,
        "api" => api.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment total count of backend exchanges.
pub fn increment_backend_request_total(backend: &str, method: &str, status: u16) {
    counter!(
        GATEHOUSE_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed backend request duration.
pub fn record_backend_request_duration(backend: &str, method: &str, duration: Duration) {
    histogram!(
        GATEHOUSE_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_backend_connect_failure(backend: &str) {
    counter!(GATEHOUSE_BACKEND_CONNECT_FAILURES_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn increment_denial(code: &str) {
    counter!(GATEHOUSE_GATEKEEPER_DENIALS_TOTAL, "code" => code.to_string()).increment(1);
}

pub fn increment_cache_result(result: &str) {
    counter!(GATEHOUSE_CACHE_RESULTS_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn increment_log_records_dropped() {
    counter!(GATEHOUSE_LOG_RECORDS_DROPPED_TOTAL).increment(1);
}

/// RAII guard that counts a request as active while alive.
pub struct ActiveRequestGuard(());

impl ActiveRequestGuard {
    pub fn new() -> Self {
        let active = ACTIVE_REQUESTS.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(GATEHOUSE_ACTIVE_REQUESTS).set(active as f64);
        Self(())
    }
}

impl Default for ActiveRequestGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        let active = ACTIVE_REQUESTS.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(GATEHOUSE_ACTIVE_REQUESTS).set(active as f64);
    }
}

/// RAII helper measuring backend request duration.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
    method: String,
}

impl BackendRequestTimer {
    pub fn new(backend: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            method: method.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(&self.backend, &self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Gatehouse metrics system");
    Lazy::force(&ACTIVE_REQUESTS);
    Ok(())
}
