pub mod config_provider;
pub mod geoip;
pub mod http_client;
pub mod identity;
pub mod log_sink;
pub mod rate_limit;
