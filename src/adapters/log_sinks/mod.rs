//! [`LogSink`](crate::ports::log_sink::LogSink) implementations.
pub mod http;
pub mod memory;
pub mod tracing_sink;

pub use http::HttpLogSink;
pub use memory::MemoryLogSink;
pub use tracing_sink::TracingLogSink;
