//! Analytics record assembled once per pipeline pass, when the response is complete.
//!
//! A dispatched request (successful or not) serializes every field, `null`
//! where nothing is known. A request that never reached a backend (denied or
//! unrouted) serializes only request-side fields plus the admission outcome,
//! the status and the total time; backend and user fields are left out
//! entirely.
use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use chrono::Utc;
use http::{HeaderMap, header};
use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::{
    core::{
        cache::CacheStatus,
        dispatcher::DispatchOutcome,
        gatekeeper::{AdmissionResult, DenialCode},
        normalizer::{MAX_HEADER_LENGTH, NormalizedRequest, QueryParams, truncate},
        user_agent,
    },
    ports::geoip::{GeoLocation, GeoPoint},
};

/// Every field name a fully populated record carries.
pub const FIELDS: [&str; 42] = [
    "api_key",
    "backend_response_time",
    "gatekeeper_denied_code",
    "internal_gatekeeper_time",
    "proxy_overhead",
    "request_accept",
    "request_accept_encoding",
    "request_at",
    "request_basic_auth_username",
    "request_connection",
    "request_content_type",
    "request_hierarchy",
    "request_host",
    "request_ip",
    "request_ip_city",
    "request_ip_country",
    "request_ip_location",
    "request_ip_region",
    "request_method",
    "request_origin",
    "request_path",
    "request_query",
    "request_referer",
    "request_scheme",
    "request_size",
    "request_url",
    "request_user_agent",
    "request_user_agent_family",
    "request_user_agent_type",
    "response_age",
    "response_cache",
    "response_content_encoding",
    "response_content_length",
    "response_content_type",
    "response_server",
    "response_size",
    "response_status",
    "response_time",
    "response_transfer_encoding",
    "user_email",
    "user_id",
    "user_registration_source",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordScope {
    /// The request was handed to the dispatcher.
    Full,
    /// The pipeline stopped before dispatch.
    RequestOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub scope: RecordScope,
    pub api_key: Option<String>,
    pub backend_response_time: Option<f64>,
    pub gatekeeper_denied_code: Option<DenialCode>,
    pub internal_gatekeeper_time: Option<f64>,
    pub proxy_overhead: Option<f64>,
    pub request_accept: Option<String>,
    pub request_accept_encoding: Option<String>,
    /// Epoch milliseconds at which the response finished.
    pub request_at: i64,
    pub request_basic_auth_username: Option<String>,
    pub request_connection: Option<String>,
    pub request_content_type: Option<String>,
    pub request_hierarchy: Vec<String>,
    pub request_host: String,
    pub request_ip: IpAddr,
    pub request_ip_city: Option<String>,
    pub request_ip_country: Option<String>,
    pub request_ip_location: Option<GeoPoint>,
    pub request_ip_region: Option<String>,
    pub request_method: String,
    pub request_origin: Option<String>,
    pub request_path: String,
    pub request_query: QueryParams,
    pub request_referer: Option<String>,
    pub request_scheme: String,
    pub request_size: u64,
    pub request_url: String,
    pub request_user_agent: Option<String>,
    pub request_user_agent_family: Option<String>,
    pub request_user_agent_type: Option<String>,
    pub response_age: Option<u64>,
    pub response_cache: Option<CacheStatus>,
    pub response_content_encoding: Option<String>,
    pub response_content_length: Option<u64>,
    pub response_content_type: Option<String>,
    pub response_server: Option<String>,
    pub response_size: Option<u64>,
    pub response_status: u16,
    /// Total time in the gateway, milliseconds.
    pub response_time: f64,
    pub response_transfer_encoding: Option<String>,
    pub user_email: Option<String>,
    pub user_id: Option<String>,
    pub user_registration_source: Option<String>,
}

/// Clock readings taken along the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub started: Instant,
    pub gatekeeper: Option<Duration>,
}

impl Timings {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            gatekeeper: None,
        }
    }
}

/// What was sent back to the client.
#[derive(Debug, Clone, Default)]
pub struct ResponseSummary {
    pub status: u16,
    pub headers: HeaderMap,
    /// Bytes on the wire: status line, headers and body.
    pub size: u64,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| truncate(&String::from_utf8_lossy(value.as_bytes()), MAX_HEADER_LENGTH))
}

/// Assemble the record. Call exactly once, after the response is complete.
pub fn build(
    request: &NormalizedRequest,
    geo: Option<&GeoLocation>,
    admission: Option<&AdmissionResult>,
    dispatch: Option<&DispatchOutcome>,
    response: &ResponseSummary,
    timings: &Timings,
) -> LogRecord {
    let response_time = timings.started.elapsed();
    let backend_time = dispatch.and_then(DispatchOutcome::backend_response_time);
    let gatekeeper_time = timings.gatekeeper;
    let dispatched = dispatch.and_then(DispatchOutcome::response);
    let identity = admission.and_then(AdmissionResult::identity);
    let agent = request
        .headers
        .user_agent
        .as_deref()
        .and_then(user_agent::classify);

    let proxy_overhead = dispatch.map(|_| {
        let spent = response_time
            .saturating_sub(backend_time.unwrap_or_default())
            .saturating_sub(gatekeeper_time.unwrap_or_default());
        millis(spent)
    });

    LogRecord {
        scope: if dispatch.is_some() {
            RecordScope::Full
        } else {
            RecordScope::RequestOnly
        },
        api_key: admission
            .and_then(AdmissionResult::api_key)
            .map(str::to_string)
            .or_else(|| request.api_key.clone()),
        backend_response_time: backend_time.map(millis),
        gatekeeper_denied_code: admission.and_then(AdmissionResult::denial_code),
        internal_gatekeeper_time: gatekeeper_time.map(millis),
        proxy_overhead,
        request_accept: request.headers.accept.clone(),
        request_accept_encoding: request.headers.accept_encoding.clone(),
        request_at: Utc::now().timestamp_millis(),
        request_basic_auth_username: request.basic_auth_username.clone(),
        request_connection: request.headers.connection.clone(),
        request_content_type: request.headers.content_type.clone(),
        request_hierarchy: request.hierarchy.clone(),
        request_host: request.host.clone(),
        request_ip: request.client_ip,
        request_ip_city: geo.and_then(|g| g.city.clone()),
        request_ip_country: geo.and_then(|g| g.country.clone()),
        request_ip_location: geo.and_then(|g| g.location),
        request_ip_region: geo.and_then(|g| g.region.clone()),
        request_method: request.method.clone(),
        request_origin: request.headers.origin.clone(),
        request_path: request.path.clone(),
        request_query: request.query.clone(),
        request_referer: request.headers.referer.clone(),
        request_scheme: request.scheme.clone(),
        request_size: request.size,
        request_url: request.url.clone(),
        request_user_agent: request.headers.user_agent.clone(),
        request_user_agent_family: agent.as_ref().map(|a| a.family.clone()),
        request_user_agent_type: agent.as_ref().map(|a| a.kind.to_string()),
        response_age: dispatched.and_then(|r| r.response_age),
        response_cache: dispatched.and_then(|r| r.cache_status),
        response_content_encoding: header_value(&response.headers, header::CONTENT_ENCODING),
        response_content_length: response
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        response_content_type: header_value(&response.headers, header::CONTENT_TYPE),
        response_server: header_value(&response.headers, header::SERVER),
        response_size: dispatch.map(|_| response.size),
        response_status: response.status,
        response_time: millis(response_time),
        response_transfer_encoding: header_value(&response.headers, header::TRANSFER_ENCODING),
        user_email: identity.and_then(|i| i.user_email.clone()),
        user_id: identity.map(|i| i.user_id.clone()),
        user_registration_source: identity.and_then(|i| i.user_registration_source.clone()),
    }
}

impl LogRecord {
    pub fn is_full(&self) -> bool {
        self.scope == RecordScope::Full
    }

    /// Value of a logged query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.request_query.get(key)
    }
}

impl Serialize for LogRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let full = self.is_full();
        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("api_key", &self.api_key)?;
        if full {
            map.serialize_entry("backend_response_time", &self.backend_response_time)?;
        }
        map.serialize_entry("gatekeeper_denied_code", &self.gatekeeper_denied_code)?;
        map.serialize_entry("internal_gatekeeper_time", &self.internal_gatekeeper_time)?;
        if full {
            map.serialize_entry("proxy_overhead", &self.proxy_overhead)?;
        }

        map.serialize_entry("request_accept", &self.request_accept)?;
        map.serialize_entry("request_accept_encoding", &self.request_accept_encoding)?;
        map.serialize_entry("request_at", &self.request_at)?;
        map.serialize_entry("request_basic_auth_username", &self.request_basic_auth_username)?;
        map.serialize_entry("request_connection", &self.request_connection)?;
        map.serialize_entry("request_content_type", &self.request_content_type)?;
        map.serialize_entry("request_hierarchy", &self.request_hierarchy)?;
        map.serialize_entry("request_host", &self.request_host)?;
        map.serialize_entry("request_ip", &self.request_ip)?;
        map.serialize_entry("request_ip_city", &self.request_ip_city)?;
        map.serialize_entry("request_ip_country", &self.request_ip_country)?;
        map.serialize_entry("request_ip_location", &self.request_ip_location)?;
        map.serialize_entry("request_ip_region", &self.request_ip_region)?;
        map.serialize_entry("request_method", &self.request_method)?;
        map.serialize_entry("request_origin", &self.request_origin)?;
        map.serialize_entry("request_path", &self.request_path)?;
        map.serialize_entry("request_query", &self.request_query)?;
        map.serialize_entry("request_referer", &self.request_referer)?;
        map.serialize_entry("request_scheme", &self.request_scheme)?;
        map.serialize_entry("request_size", &self.request_size)?;
        map.serialize_entry("request_url", &self.request_url)?;
        map.serialize_entry("request_user_agent", &self.request_user_agent)?;
        map.serialize_entry("request_user_agent_family", &self.request_user_agent_family)?;
        map.serialize_entry("request_user_agent_type", &self.request_user_agent_type)?;

        if full {
            map.serialize_entry("response_age", &self.response_age)?;
            map.serialize_entry("response_cache", &self.response_cache)?;
            map.serialize_entry("response_content_encoding", &self.response_content_encoding)?;
            map.serialize_entry("response_content_length", &self.response_content_length)?;
            map.serialize_entry("response_content_type", &self.response_content_type)?;
            map.serialize_entry("response_server", &self.response_server)?;
            map.serialize_entry("response_size", &self.response_size)?;
        }
        map.serialize_entry("response_status", &self.response_status)?;
        map.serialize_entry("response_time", &self.response_time)?;
        if full {
            map.serialize_entry("response_transfer_encoding", &self.response_transfer_encoding)?;
            map.serialize_entry("user_email", &self.user_email)?;
            map.serialize_entry("user_id", &self.user_id)?;
            map.serialize_entry("user_registration_source", &self.user_registration_source)?;
        }

        map.end()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};

    use super::*;
    use crate::core::{
        dispatcher::DispatchedResponse,
        gatekeeper::ApiIdentity,
        normalizer::{CapturedHeaders, parse_query},
    };

    fn request() -> NormalizedRequest {
        NormalizedRequest {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            host: "localhost:9080".to_string(),
            client_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            path: "/hello".to_string(),
            raw_query: Some("a=1&a=2".to_string()),
            query: parse_query("a=1&a=2"),
            hierarchy: vec!["0/localhost:9080/".to_string(), "1/localhost:9080/hello".to_string()],
            headers: CapturedHeaders {
                user_agent: Some("curl/8.4.0".to_string()),
                ..Default::default()
            },
            basic_auth_username: None,
            api_key: Some("KEY".to_string()),
            url: "http://localhost:9080/hello?a=1&a=2".to_string(),
            size: 64,
        }
    }

    fn admitted() -> AdmissionResult {
        AdmissionResult::Admitted {
            identity: Some(ApiIdentity {
                api_key: "KEY".to_string(),
                user_id: "u1".to_string(),
                user_email: Some("u1@example.com".to_string()),
                user_registration_source: None,
            }),
        }
    }

    fn success() -> DispatchOutcome {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        DispatchOutcome::Success(DispatchedResponse {
            status: StatusCode::OK,
            backend_response_time: Duration::from_millis(1),
            headers,
            body: Bytes::from_static(b"hi"),
            body_size: 2,
            cache_status: Some(CacheStatus::Miss),
            response_age: None,
        })
    }

    fn summary(status: u16) -> ResponseSummary {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        ResponseSummary {
            status,
            headers,
            size: 80,
        }
    }

    fn keys(record: &LogRecord) -> Vec<String> {
        let value = serde_json::to_value(record).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[test]
    fn dispatched_record_has_every_field() {
        let timings = Timings {
            started: Instant::now(),
            gatekeeper: Some(Duration::from_micros(50)),
        };
        let record = build(
            &request(),
            None,
            Some(&admitted()),
            Some(&success()),
            &summary(200),
            &timings,
        );
        assert_eq!(keys(&record), FIELDS.iter().map(|f| f.to_string()).collect::<Vec<_>>());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["response_cache"], "MISS");
        assert_eq!(value["request_query"]["a"], "1,2");
        assert_eq!(value["request_user_agent_family"], "cURL");
        assert_eq!(value["response_content_length"], 2);
        assert!(value["request_ip_city"].is_null());
        assert!(value["proxy_overhead"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn denied_record_leaves_out_backend_and_user_fields() {
        let denied = AdmissionResult::Denied {
            code: DenialCode::ApiKeyInvalid,
            api_key: Some("bogus".to_string()),
        };
        let record = build(&request(), None, Some(&denied), None, &summary(403), &Timings::start());
        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(value["gatekeeper_denied_code"], "api_key_invalid");
        assert_eq!(value["api_key"], "bogus");
        assert_eq!(value["response_status"], 403);
        for absent in [
            "user_id",
            "user_email",
            "user_registration_source",
            "backend_response_time",
            "proxy_overhead",
            "response_cache",
            "response_size",
            "response_content_type",
        ] {
            assert!(!object.contains_key(absent), "{absent} should be absent");
        }
        assert!(object.contains_key("request_user_agent_type"));
    }

    #[test]
    fn backend_failure_keeps_full_scope_without_response_fields() {
        let outcome = DispatchOutcome::BackendUnavailable {
            elapsed: Duration::from_millis(3),
        };
        let record = build(
            &request(),
            None,
            Some(&admitted()),
            Some(&outcome),
            &ResponseSummary {
                status: 502,
                ..Default::default()
            },
            &Timings::start(),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value.as_object().unwrap().len(), FIELDS.len());
        assert!(value["backend_response_time"].is_null());
        assert_eq!(value["response_status"], 502);
    }

    #[test]
    fn request_at_is_taken_at_build_time() {
        let started = Instant::now() - Duration::from_secs(3);
        let record = build(
            &request(),
            None,
            None,
            None,
            &summary(404),
            &Timings {
                started,
                gatekeeper: None,
            },
        );
        let now = Utc::now().timestamp_millis();
        assert!((now - record.request_at).abs() < 500);
        assert!(record.response_time >= 3000.0);
    }

    #[test]
    fn response_headers_are_truncated() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SERVER,
            HeaderValue::from_str(&"s".repeat(300)).unwrap(),
        );
        let record = build(
            &request(),
            None,
            Some(&admitted()),
            Some(&success()),
            &ResponseSummary {
                status: 200,
                headers,
                size: 10,
            },
            &Timings::start(),
        );
        assert_eq!(record.response_server.unwrap().len(), MAX_HEADER_LENGTH);
    }
}
