use async_trait::async_trait;

use crate::config::RateLimitConfig;

/// An API key holder as known to the identity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiUser {
    pub id: String,
    pub api_key: String,
    pub email: Option<String>,
    pub registration_source: Option<String>,
    pub disabled: bool,
    /// Quota replacing the gateway default for this user.
    pub rate_limit: Option<RateLimitConfig>,
}

/// Lookup of API keys. The gateway never owns key storage.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn lookup(&self, api_key: &str) -> Option<ApiUser>;
}
