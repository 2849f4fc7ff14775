#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::models::{
        AdminConfig, ApiConfig, GatewayConfig, LogSinkKind, RateLimitConfig, ServerConfig,
    },
    core::client_ip::IpNetwork,
};

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*(:\d{1,5})?$")
        .expect("invalid hostname regex")
});

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        for proxy in &config.trusted_proxies {
            if let Err(e) = IpNetwork::parse(proxy) {
                errors.push(ValidationError::InvalidField {
                    field: "trusted_proxies".to_string(),
                    message: format!("'{proxy}': {e}"),
                });
            }
        }

        for (field, value) in [
            ("timeouts.connect", &config.timeouts.connect),
            ("timeouts.response", &config.timeouts.response),
            ("log_sink.flush_interval", &config.log_sink.flush_interval),
        ] {
            if let Err(e) = Self::validate_duration(field, value) {
                errors.push(e);
            }
        }

        if config.limits.max_request_line == 0 {
            errors.push(ValidationError::InvalidField {
                field: "limits.max_request_line".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Err(e) = Self::validate_rate_limit("rate_limit", &config.rate_limit) {
            errors.push(e);
        }

        if config.log_sink.kind == LogSinkKind::Http && config.log_sink.url.is_none() {
            errors.push(ValidationError::MissingField {
                field: "log_sink.url".to_string(),
            });
        }

        if let Some(admin) = &config.admin {
            if let Err(mut admin_errors) = Self::validate_admin(admin) {
                errors.append(&mut admin_errors);
            }
        }

        let mut seen_keys = HashSet::new();
        for user in &config.api_users {
            if user.api_key.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("api_users '{}' api_key", user.id),
                });
            } else if !seen_keys.insert(user.api_key.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("api_users '{}' api_key", user.id),
                    message: "API key is assigned to more than one user".to_string(),
                });
            }
            if let Some(limit) = &user.rate_limit {
                if let Err(e) =
                    Self::validate_rate_limit(&format!("api_users '{}' rate_limit", user.id), limit)
                {
                    errors.push(e);
                }
            }
        }

        for entry in &config.geoip {
            if let Err(e) = IpNetwork::parse(&entry.cidr) {
                errors.push(ValidationError::InvalidField {
                    field: "geoip cidr".to_string(),
                    message: format!("'{}': {e}", entry.cidr),
                });
            }
        }

        for api in &config.apis {
            if let Err(mut api_errors) = Self::validate_api(api) {
                errors.append(&mut api_errors);
            }
        }

        if let Err(conflict_error_list) = Self::check_route_conflicts(&config.apis) {
            errors.extend(conflict_error_list);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:9080' or '0.0.0.0:80')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        match humantime::parse_duration(value) {
            Ok(d) if d.is_zero() => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Duration must be greater than zero".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            }),
        }
    }

    fn validate_rate_limit(field: &str, config: &RateLimitConfig) -> ValidationResult<()> {
        if config.requests == 0 || config.requests > u64::from(u32::MAX) {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.requests"),
                message: "Rate limit requests must be between 1 and 4294967295".to_string(),
            });
        }
        Self::validate_duration(&format!("{field}.period"), &config.period)
    }

    fn validate_admin(admin: &AdminConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if admin.backend_host.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "admin.backend_host".to_string(),
            });
        }
        errors.extend(Self::validate_servers("admin", &admin.servers));
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_servers(owner: &str, servers: &[ServerConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if servers.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("{owner} servers"),
                message: "At least one backend server is required".to_string(),
            });
        }
        for server in servers {
            if server.host.is_empty() || server.port == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("{owner} servers"),
                    message: format!("Invalid server '{}:{}'", server.host, server.port),
                });
            }
        }
        errors
    }

    /// Validate a single API definition
    fn validate_api(api: &ApiConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let owner = format!("api '{}'", api.name);

        if api.frontend_host != "*" {
            if let Err(e) = Self::validate_host(&api.frontend_host, &owner) {
                errors.push(e);
            }
        }
        if api.backend_host.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("{owner} backend_host"),
            });
        }

        errors.extend(Self::validate_servers(&owner, &api.servers));

        if api.url_matches.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("{owner} url_matches"),
                message: "At least one url match is required".to_string(),
            });
        }
        for url_match in &api.url_matches {
            for (name, prefix) in [
                ("frontend_prefix", &url_match.frontend_prefix),
                ("backend_prefix", &url_match.backend_prefix),
            ] {
                if !prefix.starts_with('/') {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{owner} {name}: {prefix}"),
                        message: "Prefixes must start with '/'".to_string(),
                    });
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Two url matches conflict when they share host and frontend prefix; the
    /// later one could never be selected.
    fn check_route_conflicts(apis: &[ApiConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen: HashSet<(String, &str)> = HashSet::new();

        for api in apis {
            for url_match in &api.url_matches {
                let key = (
                    api.frontend_host.to_ascii_lowercase(),
                    url_match.frontend_prefix.as_str(),
                );
                if !seen.insert(key) {
                    errors.push(ValidationError::RouteConflict {
                        message: format!(
                            "Duplicate url match '{}' for host '{}' (api '{}')",
                            url_match.frontend_prefix, api.frontend_host, api.name
                        ),
                    });
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate host field format
    fn validate_host(host: &str, owner: &str) -> ValidationResult<()> {
        if host.is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("{owner} frontend_host"),
                message: "Host cannot be empty".to_string(),
            });
        }

        if host.contains("://") {
            return Err(ValidationError::InvalidField {
                field: format!("{owner} frontend_host"),
                message: "Host should not contain protocol (e.g., use 'example.com' not 'http://example.com')".to_string(),
            });
        }

        if !HOSTNAME_REGEX.is_match(host) {
            return Err(ValidationError::InvalidField {
                field: format!("{owner} frontend_host"),
                message: format!("Invalid hostname format: '{host}'"),
            });
        }

        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
