//! Gatehouse - an API management gateway.
//!
//! Gatehouse sits in front of backend APIs and runs every request through a
//! fixed pipeline:
//!
//! 1. **Normalize** the raw request into a canonical view (escaped path,
//!    parsed query, path hierarchy, captured headers, resolved client IP).
//! 2. **Route** it by host and longest path prefix to a published API, or to
//!    one of the built-in routes (`/admin`, `/_gateway`).
//! 3. **Admit** it: API key lookup, disabled accounts, per-user or per-IP
//!    rate limits.
//! 4. **Dispatch** it to a backend server with connect and response
//!    timeouts, client-cancel detection and an optional shared response cache.
//! 5. **Record** one analytics [`LogRecord`](core::log_record::LogRecord) per
//!    request and hand it to a [`LogSink`](ports::log_sink::LogSink).
//!
//! # Quick Example
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use gatehouse::{
//!     GatewayService, HttpClientAdapter, HttpHandler, TracingLogSink, adapters::router,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = gatehouse::config::load_config("config.toml").await?;
//! let client = Arc::new(HttpClientAdapter::new(config.timeouts.connect_duration()?)?);
//! let gateway = Arc::new(GatewayService::new(config, client, Arc::new(TracingLogSink))?);
//! let app = router(HttpHandler::new(gateway));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9080").await?;
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//! )
//! .await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping the pipeline inside `core`. Configuration-derived state lives
//! in an immutable snapshot swapped atomically on reload.
//!
//! # Error Handling
//! Fallible setup APIs return `eyre::Result<T>` with `WrapErr` context.
//! Request-level failures are never errors: they become status codes and
//! show up in the analytics record.
//!
//! # Concurrency & Data Structures
//! Shared maps (response cache, in-flight fetches, per-user limiters) use
//! `scc::HashMap`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler, HttpLogSink, MemoryLogSink, TracingLogSink},
    core::GatewayService,
    ports::{http_client::HttpClient, log_sink::LogSink},
    utils::GracefulShutdown,
};
