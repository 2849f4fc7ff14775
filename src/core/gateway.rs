//! Core gateway orchestration service.
//!
//! [`GatewayService`] runs one request through the pipeline:
//! normalize, route, admit, dispatch and finally build the analytics record.
//! Everything derived from configuration lives in an immutable
//! [`GatewaySnapshot`] behind an `ArcSwap`; a request loads the snapshot once
//! and keeps it for its whole lifetime, so a reload never shows up halfway
//! through a request.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use arc_swap::ArcSwap;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use eyre::{Result, WrapErr, eyre};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};
use hyper::Response;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::{geoip::StaticGeoIp, identity::StaticApiKeyStore},
    config::{GatewayConfig, HeaderList},
    core::{
        cache::ResponseCache,
        client_ip::{ClientAddress, TrustedProxies},
        dispatcher::{BackendRequest, DispatchOutcome, Dispatcher},
        gatekeeper::{AdmissionResult, Gatekeeper},
        log_record::{self, ResponseSummary, Timings},
        normalizer::{NormalizedRequest, Normalizer, RawRequest},
        rate_limiter::GovernorRateLimiter,
        router::{BackendRoute, InternalRoute, RouteMatch, RouteTable, strip_port},
    },
    metrics,
    ports::{geoip::GeoIpResolver, http_client::HttpClient, log_sink::LogSink},
    tracing_setup,
};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_API_KEY: &str = "x-api-key";
pub const X_CACHE: &str = "x-cache";

/// Everything derived from one configuration document.
pub struct GatewaySnapshot {
    pub config: Arc<GatewayConfig>,
    pub routes: RouteTable,
    pub proxies: TrustedProxies,
    pub normalizer: Normalizer,
    pub gatekeeper: Gatekeeper,
    pub geoip: Arc<dyn GeoIpResolver>,
    limiter: Arc<GovernorRateLimiter>,
}

impl GatewaySnapshot {
    /// Build a snapshot, reusing the rate-limit state of `previous` when the
    /// default quota did not change.
    pub fn build(config: GatewayConfig, previous: Option<&GatewaySnapshot>) -> Result<Self> {
        let proxies = TrustedProxies::parse(&config.trusted_proxies)
            .map_err(|e| eyre!("Invalid trusted proxy: {}", e))?;
        let geoip = StaticGeoIp::new(&config.geoip).wrap_err("Failed to build geoip table")?;

        let limiter = match previous {
            Some(previous) if previous.config.rate_limit == config.rate_limit => {
                previous.limiter.clone()
            }
            _ => Arc::new(
                GovernorRateLimiter::new(&config.rate_limit)
                    .wrap_err("Invalid default rate limit")?,
            ),
        };
        let keys = Arc::new(StaticApiKeyStore::new(&config.api_users));

        Ok(Self {
            routes: RouteTable::new(&config.apis, config.admin.as_ref()),
            proxies,
            normalizer: Normalizer::new(config.limits.max_request_line),
            gatekeeper: Gatekeeper::new(keys, limiter.clone()),
            geoip: Arc::new(geoip),
            limiter,
            config: Arc::new(config),
        })
    }
}

/// A request as handed over by the HTTP server, body already read.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    /// Request target as received (path and query).
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: SocketAddr,
    /// Scheme of the listener the request arrived on.
    pub listener_scheme: &'static str,
}

/// Response pieces before they become a `hyper::Response`.
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(status: StatusCode, code: &str, message: &str) -> Self {
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    fn redirect(location: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(location) {
            headers.insert(header::LOCATION, value);
        }
        Self {
            status: StatusCode::MOVED_PERMANENTLY,
            headers,
            body: Bytes::new(),
        }
    }

    fn into_response(self) -> Response<AxumBody> {
        let mut response = Response::new(AxumBody::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Per-request state carried through the pipeline stages.
struct RequestState {
    snapshot: Arc<GatewaySnapshot>,
    request: NormalizedRequest,
    timings: Timings,
    route: Option<Arc<BackendRoute>>,
    admission: Option<AdmissionResult>,
    outcome: Option<DispatchOutcome>,
}

pub struct GatewayService {
    snapshot: ArcSwap<GatewaySnapshot>,
    dispatcher: Dispatcher,
    sink: Arc<dyn LogSink>,
}

impl GatewayService {
    /// Build the service from an initial configuration. Timeouts and the
    /// cache size are read here once; later reloads change routing,
    /// identities and quotas only.
    pub fn new(
        config: GatewayConfig,
        client: Arc<dyn HttpClient>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let response_timeout = config
            .timeouts
            .response_duration()
            .wrap_err("Invalid response timeout")?;
        let cache = config
            .cache
            .enabled
            .then(|| ResponseCache::new(config.cache.max_entries));
        let snapshot = GatewaySnapshot::build(config, None)?;

        tracing::info!(
            routes = snapshot.routes.len(),
            cache = cache.is_some(),
            "Gateway service initialized"
        );
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            dispatcher: Dispatcher::new(client, cache, response_timeout),
            sink,
        })
    }

    /// Swap in a new configuration. On error the current snapshot stays active.
    pub fn reload(&self, config: GatewayConfig) -> Result<()> {
        let current = self.snapshot.load_full();
        let snapshot = GatewaySnapshot::build(config, Some(&*current))?;
        let routes = snapshot.routes.len();
        self.snapshot.store(Arc::new(snapshot));
        tracing::info!(routes, "Configuration snapshot replaced");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<GatewaySnapshot> {
        self.snapshot.load_full()
    }

    pub fn response_cache(&self) -> Option<&ResponseCache> {
        self.dispatcher.cache()
    }

    /// Drop rate-limit buckets that have fully refilled.
    pub fn purge_rate_limits(&self) {
        self.snapshot.load().limiter.retain_recent();
    }

    /// Run one request through the pipeline. Never fails: every problem is
    /// answered with a status code.
    pub async fn handle(&self, inbound: InboundRequest, cancel: CancellationToken) -> Response<AxumBody> {
        let span = tracing_setup::create_request_span(inbound.method.as_str(), &inbound.target);
        let started = Instant::now();
        let response = self.run(inbound, cancel).instrument(span.clone()).await;
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", started.elapsed().as_secs_f64() * 1000.0);
        response
    }

    async fn run(&self, inbound: InboundRequest, cancel: CancellationToken) -> Response<AxumBody> {
        let timings = Timings::start();
        let snapshot = self.snapshot.load_full();
        let client = snapshot.proxies.resolve(
            inbound.peer.ip(),
            &inbound.headers,
            inbound.listener_scheme,
        );

        let raw = RawRequest {
            method: inbound.method.as_str(),
            target: inbound.target.as_bytes(),
            version: version_token(inbound.version),
            headers: &inbound.headers,
            scheme: &client.scheme,
            client_ip: client.ip,
            body_size: inbound.body.len() as u64,
        };
        let request = match snapshot.normalizer.normalize(&raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(peer = %inbound.peer, error = %e, "Rejecting oversized request");
                return Reply::json(StatusCode::URI_TOO_LONG, "uri_too_long", "Request-URI Too Long")
                    .into_response();
            }
        };

        let matched = snapshot.routes.resolve(&request.host, &request.path);
        let mut state = RequestState {
            snapshot: snapshot.clone(),
            request,
            timings,
            route: None,
            admission: None,
            outcome: None,
        };

        let (route, rewritten_path) = match matched {
            Some(RouteMatch::Internal(InternalRoute::Admin)) => {
                return self.handle_admin(&state, &inbound, &client, &cancel).await;
            }
            Some(RouteMatch::Internal(InternalRoute::GatewayApi)) => {
                return self.handle_gateway_api(&state, &inbound);
            }
            Some(RouteMatch::Backend {
                route,
                rewritten_path,
            }) => (route, rewritten_path),
            None => {
                let reply = Reply::json(
                    StatusCode::NOT_FOUND,
                    "not_found",
                    "No API matches this host and path.",
                );
                return self.finish(state, reply, inbound.method == Method::HEAD).await;
            }
        };
        state.route = Some(route.clone());

        let gatekeeper_started = Instant::now();
        let admission = snapshot.gatekeeper.admit(&state.request, &route).await;
        state.timings.gatekeeper = Some(gatekeeper_started.elapsed());
        if let AdmissionResult::Denied { code, .. } = &admission {
            metrics::increment_denial(code.as_str());
            let reply = Reply::json(
                StatusCode::from_u16(code.status()).unwrap_or(StatusCode::FORBIDDEN),
                code.as_str(),
                code.message(),
            );
            state.admission = Some(admission);
            return self.finish(state, reply, inbound.method == Method::HEAD).await;
        }
        state.admission = Some(admission);

        let is_head = inbound.method == Method::HEAD;
        let backend_request = BackendRequest {
            headers: forward_headers(&inbound, &client, &route.settings.headers),
            path_and_query: match &state.request.raw_query {
                Some(query) => format!("{rewritten_path}?{query}"),
                None => rewritten_path,
            },
            method: inbound.method,
            body: inbound.body,
        };
        let outcome = self.dispatcher.dispatch(backend_request, &route, &cancel).await;
        let reply = outcome_reply(&outcome, &route);
        state.outcome = Some(outcome);
        self.finish(state, reply, is_head).await
    }

    /// Build and emit the analytics record, then hand back the response.
    async fn finish(&self, state: RequestState, reply: Reply, is_head: bool) -> Response<AxumBody> {
        let mut logged_headers = reply.headers.clone();
        if let Some(encoding) = state
            .outcome
            .as_ref()
            .and_then(DispatchOutcome::response)
            .and_then(|r| r.headers.get(header::TRANSFER_ENCODING))
        {
            logged_headers.insert(header::TRANSFER_ENCODING, encoding.clone());
        }
        let body_len = if is_head { 0 } else { reply.body.len() };
        let summary = ResponseSummary {
            status: reply.status.as_u16(),
            size: wire_size(reply.status, &reply.headers, body_len),
            headers: logged_headers,
        };

        let geo = state.snapshot.geoip.lookup(state.request.client_ip);
        let record = log_record::build(
            &state.request,
            geo.as_ref(),
            state.admission.as_ref(),
            state.outcome.as_ref(),
            &summary,
            &state.timings,
        );

        let api = state.route.as_ref().map_or("none", |r| r.api_name.as_str());
        metrics::increment_request_total(api, &state.request.method, summary.status);
        metrics::record_request_duration(api, &state.request.method, state.timings.started.elapsed());
        tracing::debug!(
            method = %state.request.method,
            path = %state.request.path,
            status = summary.status,
            response_time = record.response_time,
            "Request complete"
        );

        self.sink.write(record).await;

        let mut reply = reply;
        if is_head {
            reply.body = Bytes::new();
        }
        reply.into_response()
    }

    async fn handle_admin(
        &self,
        state: &RequestState,
        inbound: &InboundRequest,
        client: &ClientAddress,
        cancel: &CancellationToken,
    ) -> Response<AxumBody> {
        let request = &state.request;
        let host = strip_port(&request.host);
        if client.scheme != "https" {
            let https_port = state.snapshot.config.https_port;
            let authority = if https_port == 443 {
                host.to_string()
            } else {
                format!("{host}:{https_port}")
            };
            return Reply::redirect(&format!("https://{authority}{}", request.path_and_query()))
                .into_response();
        }
        if request.path == "/admin" {
            return Reply::redirect(&format!("https://{}/admin/", request.host)).into_response();
        }

        let Some(route) = state.snapshot.routes.admin_route() else {
            return Reply::json(StatusCode::NOT_FOUND, "not_found", "Not Found").into_response();
        };
        let backend_request = BackendRequest {
            method: inbound.method.clone(),
            path_and_query: request.path_and_query(),
            headers: forward_headers(inbound, client, &HeaderList::default()),
            body: inbound.body.clone(),
        };
        let outcome = self
            .dispatcher
            .dispatch_uncached(backend_request, route, cancel)
            .await;
        outcome_reply(&outcome, route).into_response()
    }

    fn handle_gateway_api(&self, state: &RequestState, inbound: &InboundRequest) -> Response<AxumBody> {
        if state.request.path != "/_gateway/health" || inbound.method != Method::GET {
            return Reply::json(StatusCode::NOT_FOUND, "not_found", "Not Found").into_response();
        }
        let snapshot = &state.snapshot;
        let body = serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "apis": snapshot.config.apis.len(),
            "routes": snapshot.routes.len(),
            "cache_entries": self.response_cache().map_or(0, ResponseCache::len),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Reply {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(body.to_string()),
        }
        .into_response()
    }
}

/// Client-facing reply for a dispatch outcome.
fn outcome_reply(outcome: &DispatchOutcome, route: &BackendRoute) -> Reply {
    let response = match outcome {
        DispatchOutcome::Success(response) => response,
        DispatchOutcome::Timeout { .. } => {
            return Reply::json(StatusCode::GATEWAY_TIMEOUT, "gateway_timeout", "Gateway Timeout");
        }
        DispatchOutcome::BackendUnavailable { .. } => {
            return Reply::json(StatusCode::BAD_GATEWAY, "bad_gateway", "Bad Gateway");
        }
        DispatchOutcome::Canceled { .. } => {
            return Reply {
                status: StatusCode::from_u16(outcome.status()).unwrap_or(StatusCode::BAD_REQUEST),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            };
        }
    };

    let mut headers = response.headers.clone();
    strip_hop_by_hop(&mut headers);
    if !headers.contains_key(header::CONTENT_LENGTH) || !response.body.is_empty() {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response.body_size));
    }
    for entry in route.settings.default_response_headers.iter() {
        if let Some((name, value)) = header_pair(&entry.key, &entry.value) {
            if !headers.contains_key(&name) {
                headers.insert(name, value);
            }
        }
    }
    for entry in route.settings.override_response_headers.iter() {
        if let Some((name, value)) = header_pair(&entry.key, &entry.value) {
            headers.insert(name, value);
        }
    }
    if let Some(cache_status) = response.cache_status {
        headers.insert(X_CACHE, HeaderValue::from_static(cache_status.as_str()));
    }
    if let Some(age) = response.response_age {
        headers.insert(header::AGE, HeaderValue::from(age));
    }

    Reply {
        status: response.status,
        headers,
        body: response.body.clone(),
    }
}

/// Headers sent upstream: inbound headers minus hop-by-hop and the API key,
/// plus forwarding information and the API's configured request headers.
fn forward_headers(inbound: &InboundRequest, client: &ClientAddress, extra: &HeaderList) -> HeaderMap {
    let mut headers = inbound.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(X_API_KEY);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let peer = inbound.peer.ip().to_canonical().to_string();
    let forwarded_for = match inbound
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {peer}"),
        _ => peer,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(&client.scheme) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Some(host) = inbound.headers.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }

    for entry in extra.iter() {
        if let Some((name, value)) = header_pair(&entry.key, &entry.value) {
            headers.insert(name, value);
        }
    }
    headers
}

fn header_pair(key: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    match (HeaderName::try_from(key), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            tracing::warn!(header = %key, "Skipping invalid configured header");
            None
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Approximate size on the wire of an HTTP/1.1 response.
fn wire_size(status: StatusCode, headers: &HeaderMap, body_len: usize) -> u64 {
    let reason = status.canonical_reason().unwrap_or("");
    let status_line = "HTTP/1.1 ".len() + 3 + 1 + reason.len() + 2;
    let header_bytes: usize = headers
        .iter()
        .map(|(name, value)| name.as_str().len() + 2 + value.len() + 2)
        .sum();
    (status_line + header_bytes + 2 + body_len) as u64
}
