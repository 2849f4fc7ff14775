//! Per-API-key and per-client-IP rate limiting built atop `governor`.
//!
//! A quota of `requests` per `period` is enforced as a GCRA token bucket that
//! refills one token every `period / requests` and allows bursts of
//! `requests`. Keys share one keyed limiter for the default quota; users with
//! their own quota get a dedicated limiter that is rebuilt when the quota in
//! the configuration snapshot changes.
use std::{net::IpAddr, num::NonZeroU32, sync::Arc};

use async_trait::async_trait;
use governor::{
    NotUntil, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use scc::hash_map::Entry;

use crate::{
    config::RateLimitConfig,
    ports::rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimitSubject},
};

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Invalid period string '{period}': {reason}")]
    InvalidPeriod { period: String, reason: String },
    #[error("Rate limit 'requests' must be between 1 and {}", u32::MAX)]
    InvalidRequests,
}

/// Translate a configured quota into a governor [`Quota`].
pub fn build_quota(config: &RateLimitConfig) -> Result<Quota, RateLimitError> {
    let period = humantime::parse_duration(&config.period).map_err(|e| {
        RateLimitError::InvalidPeriod {
            period: config.period.clone(),
            reason: e.to_string(),
        }
    })?;
    let requests = u32::try_from(config.requests)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(RateLimitError::InvalidRequests)?;

    Quota::with_period(period / requests.get())
        .map(|quota| quota.allow_burst(requests))
        .ok_or_else(|| RateLimitError::InvalidPeriod {
            period: config.period.clone(),
            reason: "period is too short for the number of requests".to_string(),
        })
}

struct UserLimiter {
    quota: RateLimitConfig,
    limiter: Arc<DirectRateLimiterImpl>,
}

/// [`RateLimitPolicy`] adapter that keeps all counters in memory.
pub struct GovernorRateLimiter {
    clock: DefaultClock,
    by_key: KeyedRateLimiterImpl<String>,
    by_ip: KeyedRateLimiterImpl<IpAddr>,
    per_user: scc::HashMap<String, UserLimiter>,
}

impl GovernorRateLimiter {
    pub fn new(default_quota: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let quota = build_quota(default_quota)?;
        tracing::info!(
            requests = default_quota.requests,
            period = %default_quota.period,
            "Creating default rate limiter"
        );
        Ok(Self {
            clock: DefaultClock::default(),
            by_key: RateLimiter::keyed(quota),
            by_ip: RateLimiter::keyed(quota),
            per_user: scc::HashMap::new(),
        })
    }

    /// Drop bucket state that has fully refilled.
    pub fn retain_recent(&self) {
        self.by_key.retain_recent();
        self.by_ip.retain_recent();
    }

    async fn user_limiter(
        &self,
        api_key: &str,
        quota: &RateLimitConfig,
    ) -> Option<Arc<DirectRateLimiterImpl>> {
        match self.per_user.entry_async(api_key.to_string()).await {
            Entry::Occupied(mut entry) => {
                if entry.get().quota != *quota {
                    let limiter = Arc::new(RateLimiter::direct(build_quota(quota).ok()?));
                    *entry.get_mut() = UserLimiter {
                        quota: quota.clone(),
                        limiter: limiter.clone(),
                    };
                    return Some(limiter);
                }
                Some(entry.get().limiter.clone())
            }
            Entry::Vacant(entry) => {
                let limiter = Arc::new(RateLimiter::direct(build_quota(quota).ok()?));
                entry.insert_entry(UserLimiter {
                    quota: quota.clone(),
                    limiter: limiter.clone(),
                });
                Some(limiter)
            }
        }
    }

    fn decision(
        &self,
        result: Result<(), NotUntil<<DefaultClock as Clock>::Instant>>,
    ) -> RateLimitDecision {
        match result {
            Ok(()) => RateLimitDecision::Allowed,
            Err(not_until) => RateLimitDecision::Limited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }
}

#[async_trait]
impl RateLimitPolicy for GovernorRateLimiter {
    async fn check(&self, subject: RateLimitSubject<'_>) -> RateLimitDecision {
        match subject {
            RateLimitSubject::ApiKey {
                api_key,
                quota: Some(quota),
            } => match self.user_limiter(api_key, quota).await {
                Some(limiter) => self.decision(limiter.check()),
                None => {
                    tracing::warn!(%api_key, "Invalid per-user quota, using the default");
                    self.decision(self.by_key.check_key(&api_key.to_string()))
                }
            },
            RateLimitSubject::ApiKey {
                api_key,
                quota: None,
            } => self.decision(self.by_key.check_key(&api_key.to_string())),
            RateLimitSubject::ClientIp(ip) => self.decision(self.by_ip.check_key(&ip)),
        }
    }
}
