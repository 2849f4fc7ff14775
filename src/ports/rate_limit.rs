use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;

use crate::config::RateLimitConfig;

/// What a rate-limit bucket is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitSubject<'a> {
    ApiKey {
        api_key: &'a str,
        quota: Option<&'a RateLimitConfig>,
    },
    ClientIp(IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// Over quota; the next request may pass after roughly this long.
    Limited { retry_after: Duration },
}

/// Rate-limit counters live behind this port; the gatekeeper only asks.
#[async_trait]
pub trait RateLimitPolicy: Send + Sync {
    async fn check(&self, subject: RateLimitSubject<'_>) -> RateLimitDecision;
}
