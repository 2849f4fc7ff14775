//! Configuration data structures for Gatehouse.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to the
//! JSON document served by a remote configuration endpoint. They are serde‑friendly and
//! carry defaults so that a minimal config only lists its APIs.
use std::{fmt, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

fn default_listen_addr() -> String {
    "127.0.0.1:9080".to_string()
}

fn default_https_port() -> u16 {
    9081
}

/// Root configuration snapshot.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Port advertised in redirects to the HTTPS listener (TLS is terminated upstream).
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Proxies allowed to set `X-Forwarded-For` / `X-Forwarded-Proto` (IP or CIDR).
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub log_sink: LogSinkConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub api_users: Vec<ApiUserConfig>,
    #[serde(default)]
    pub geoip: Vec<GeoIpEntry>,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            https_port: default_https_port(),
            trusted_proxies: Vec::new(),
            timeouts: TimeoutConfig::default(),
            limits: LimitsConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
            log_sink: LogSinkConfig::default(),
            admin: None,
            api_users: Vec::new(),
            geoip: Vec::new(),
            apis: Vec::new(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn https_port(mut self, port: u16) -> Self {
        self.config.https_port = port;
        self
    }

    pub fn trusted_proxy(mut self, cidr: impl Into<String>) -> Self {
        self.config.trusted_proxies.push(cidr.into());
        self
    }

    pub fn timeouts(mut self, connect: &str, response: &str) -> Self {
        self.config.timeouts = TimeoutConfig {
            connect: connect.to_string(),
            response: response.to_string(),
        };
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn rate_limit(mut self, requests: u64, period: &str) -> Self {
        self.config.rate_limit = RateLimitConfig {
            requests,
            period: period.to_string(),
        };
        self
    }

    pub fn admin(mut self, admin: AdminConfig) -> Self {
        self.config.admin = Some(admin);
        self
    }

    pub fn api_user(mut self, user: ApiUserConfig) -> Self {
        self.config.api_users.push(user);
        self
    }

    pub fn geoip(mut self, entry: GeoIpEntry) -> Self {
        self.config.geoip.push(entry);
        self
    }

    /// Append an API; declaration order is significant for routing ties.
    pub fn api(mut self, api: ApiConfig) -> Self {
        self.config.apis.push(api);
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_response_timeout() -> String {
    "60s".to_string()
}

/// Backend timeouts, written as humantime strings ("500ms", "10s").
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on establishing one backend connection.
    pub connect: String,
    /// Bound on the whole backend exchange, body included.
    pub response: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            response: default_response_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect_duration(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.connect)
    }

    pub fn response_duration(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.response)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    /// Ceiling for `METHOD SP target SP version CRLF`, in bytes.
    pub max_request_line: usize,
    pub max_request_body: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_line: 8192,
            max_request_body: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

/// Token bucket quota: `requests` per `period` (humantime, e.g. "1s", "5m", "1h").
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests: u64,
    pub period: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 1000,
            period: "1h".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_spans: false,
        }
    }
}

/// Where finished analytics records are shipped.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogSinkKind {
    #[default]
    Tracing,
    Http,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogSinkConfig {
    pub kind: LogSinkKind,
    /// Bulk endpoint receiving newline-delimited JSON (http sink only).
    pub url: Option<String>,
    pub batch_size: usize,
    pub flush_interval: String,
    pub queue_capacity: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            kind: LogSinkKind::Tracing,
            url: None,
            batch_size: 500,
            flush_interval: "1s".to_string(),
            queue_capacity: 10_000,
        }
    }
}

/// Upstream that serves the administrative web application.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    pub backend_host: String,
    #[serde(default)]
    pub backend_protocol: BackendProtocol,
    pub servers: Vec<ServerConfig>,
}

/// An API key holder as published in the configuration snapshot.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiUserConfig {
    pub api_key: String,
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub registration_source: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Per-user override of the default quota.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Static geo location table entry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeoIpEntry {
    pub cidr: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendProtocol {
    #[default]
    Http,
    Https,
}

impl BackendProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            BackendProtocol::Http => "http",
            BackendProtocol::Https => "https",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
    #[serde(rename = "random")]
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UrlMatchConfig {
    pub frontend_prefix: String,
    pub backend_prefix: String,
}

/// One published API: a host, its backend servers and the prefixes it answers on.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    pub name: String,
    /// Exact host name (port ignored) or `*` for any host.
    pub frontend_host: String,
    pub backend_host: String,
    #[serde(default)]
    pub backend_protocol: BackendProtocol,
    #[serde(default)]
    pub balance: LoadBalanceStrategy,
    pub servers: Vec<ServerConfig>,
    pub url_matches: Vec<UrlMatchConfig>,
    #[serde(default)]
    pub settings: ApiSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApiSettings {
    /// Admit requests without an API key (rate limited by client IP instead).
    pub disable_api_key: bool,
    /// Set on the request forwarded to the backend.
    pub headers: HeaderList,
    /// Added to the response when the backend did not send them.
    pub default_response_headers: HeaderList,
    /// Always set on the response, replacing backend values.
    pub override_response_headers: HeaderList,
}

/// A single `name: value` pair.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

/// Ordered header list accepted either as `[{key, value}, ...]` or as a
/// multi-line `"Key: value"` string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderList(pub Vec<HeaderEntry>);

impl HeaderList {
    /// Parse the `"Key: value"` line format. Blank lines and surrounding
    /// whitespace are ignored; only the first colon splits key from value.
    pub fn parse_lines(input: &str) -> Self {
        let entries = input
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some(HeaderEntry {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                })
            })
            .collect();
        Self(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }
}

impl fmt::Display for HeaderList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}: {}", entry.key, entry.value)?;
        }
        Ok(())
    }
}

impl Serialize for HeaderList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HeaderList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Lines(String),
            Entries(Vec<HeaderEntry>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Lines(text) => HeaderList::parse_lines(&text),
            Raw::Entries(entries) => HeaderList(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lines_ignore_blank_lines_and_whitespace() {
        let list = HeaderList::parse_lines("\n\n  X-Add1: test1\n\n\nX-Add2:test2   \n\n");
        assert_eq!(list.to_string(), "X-Add1: test1\nX-Add2: test2");
    }

    #[test]
    fn header_lines_keep_colons_in_values() {
        let list = HeaderList::parse_lines("X-Url: http://example.com:8080/\nX-Empty:");
        assert_eq!(list.0.len(), 2);
        assert_eq!(list.0[0].value, "http://example.com:8080/");
        assert_eq!(list.0[1].value, "");
    }

    #[test]
    fn header_list_accepts_both_shapes() {
        let from_string: ApiSettings =
            serde_json::from_value(serde_json::json!({ "headers": "X-A: 1\nX-B: 2" })).unwrap();
        let from_array: ApiSettings = serde_json::from_value(serde_json::json!({
            "headers": [{ "key": "X-A", "value": "1" }, { "key": "X-B", "value": "2" }]
        }))
        .unwrap();
        assert_eq!(from_string.headers, from_array.headers);
        assert_eq!(from_array.headers.to_string(), "X-A: 1\nX-B: 2");
    }

    #[test]
    fn defaults_cover_ambient_sections() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9080");
        assert_eq!(config.limits.max_request_line, 8192);
        assert_eq!(config.timeouts.connect_duration().unwrap(), Duration::from_secs(5));
        assert!(config.cache.enabled);
        assert_eq!(config.log_sink.kind, LogSinkKind::Tracing);
    }
}
