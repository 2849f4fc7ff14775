//! Admission control: API key checks followed by the rate limit.
//!
//! The gatekeeper owns neither key storage nor counters. It sequences calls
//! into the [`ApiKeyStore`] and [`RateLimitPolicy`] ports and stops at the
//! first failing check.
use std::sync::Arc;

use serde::Serialize;

use crate::{
    core::{normalizer::NormalizedRequest, router::BackendRoute},
    ports::{
        identity::ApiKeyStore,
        rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimitSubject},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    ApiKeyMissing,
    ApiKeyInvalid,
    ApiKeyDisabled,
    OverRateLimit,
}

impl DenialCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialCode::ApiKeyMissing => "api_key_missing",
            DenialCode::ApiKeyInvalid => "api_key_invalid",
            DenialCode::ApiKeyDisabled => "api_key_disabled",
            DenialCode::OverRateLimit => "over_rate_limit",
        }
    }

    /// Status code answered to the client.
    pub fn status(self) -> u16 {
        match self {
            DenialCode::OverRateLimit => 429,
            _ => 403,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            DenialCode::ApiKeyMissing => "No api_key was supplied.",
            DenialCode::ApiKeyInvalid => "An invalid api_key was supplied.",
            DenialCode::ApiKeyDisabled => "The api_key supplied has been disabled.",
            DenialCode::OverRateLimit => "You have exceeded your rate limit.",
        }
    }
}

/// Who made an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiIdentity {
    pub api_key: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_registration_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    /// `identity` is `None` for routes that do not require a key.
    Admitted { identity: Option<ApiIdentity> },
    /// The key that was presented, if any, is kept for the record.
    Denied {
        code: DenialCode,
        api_key: Option<String>,
    },
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted { .. })
    }

    pub fn denial_code(&self) -> Option<DenialCode> {
        match self {
            AdmissionResult::Denied { code, .. } => Some(*code),
            AdmissionResult::Admitted { .. } => None,
        }
    }

    pub fn identity(&self) -> Option<&ApiIdentity> {
        match self {
            AdmissionResult::Admitted { identity } => identity.as_ref(),
            AdmissionResult::Denied { .. } => None,
        }
    }

    /// API key to log, whether or not it was accepted.
    pub fn api_key(&self) -> Option<&str> {
        match self {
            AdmissionResult::Admitted { identity } => identity.as_ref().map(|i| i.api_key.as_str()),
            AdmissionResult::Denied { api_key, .. } => api_key.as_deref(),
        }
    }
}

#[derive(Clone)]
pub struct Gatekeeper {
    keys: Arc<dyn ApiKeyStore>,
    limits: Arc<dyn RateLimitPolicy>,
}

impl Gatekeeper {
    pub fn new(keys: Arc<dyn ApiKeyStore>, limits: Arc<dyn RateLimitPolicy>) -> Self {
        Self { keys, limits }
    }

    /// Run the checks in order: key present, key known, key enabled, rate limit.
    pub async fn admit(&self, request: &NormalizedRequest, route: &BackendRoute) -> AdmissionResult {
        if route.settings.disable_api_key {
            return match self.limits.check(RateLimitSubject::ClientIp(request.client_ip)).await {
                RateLimitDecision::Allowed => AdmissionResult::Admitted { identity: None },
                RateLimitDecision::Limited { .. } => AdmissionResult::Denied {
                    code: DenialCode::OverRateLimit,
                    api_key: request.api_key.clone(),
                },
            };
        }

        let Some(api_key) = request.api_key.as_deref().filter(|key| !key.is_empty()) else {
            return AdmissionResult::Denied {
                code: DenialCode::ApiKeyMissing,
                api_key: None,
            };
        };
        let deny = |code| AdmissionResult::Denied {
            code,
            api_key: Some(api_key.to_string()),
        };

        let Some(user) = self.keys.lookup(api_key).await else {
            return deny(DenialCode::ApiKeyInvalid);
        };
        if user.disabled {
            return deny(DenialCode::ApiKeyDisabled);
        }

        let subject = RateLimitSubject::ApiKey {
            api_key,
            quota: user.rate_limit.as_ref(),
        };
        if let RateLimitDecision::Limited { retry_after } = self.limits.check(subject).await {
            tracing::debug!(%api_key, ?retry_after, "Rate limit exceeded");
            return deny(DenialCode::OverRateLimit);
        }

        AdmissionResult::Admitted {
            identity: Some(ApiIdentity {
                api_key: user.api_key,
                user_id: user.id,
                user_email: user.email,
                user_registration_source: user.registration_source,
            }),
        }
    }
}
