pub mod config_providers;
pub mod geoip;
pub mod http_client;
pub mod http_handler;
pub mod identity;
pub mod log_sinks;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use geoip::StaticGeoIp;
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, router};
pub use identity::StaticApiKeyStore;
pub use log_sinks::{HttpLogSink, MemoryLogSink, TracingLogSink};
pub use middleware::*;
