//! Forwarding of admitted requests to backend servers.
//!
//! Servers of a route are tried in the order the route's balancer hands out.
//! Only a failed connection moves on to the next server; once a request has
//! reached a server it is never sent again. The whole exchange, body
//! included, is bounded by the response timeout. Client cancellation is
//! observed through a [`CancellationToken`] while the backend call is pending.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    core::{
        cache::{CacheKey, CacheStatus, CachedResponse, FetchFailure, FetchResult, Lookup, ResponseCache},
        router::BackendRoute,
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
};

/// Status answered when the client went away before the backend responded.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Request as it will be sent upstream; headers are already rewritten.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct DispatchedResponse {
    pub status: StatusCode,
    pub backend_response_time: Duration,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_size: u64,
    pub cache_status: Option<CacheStatus>,
    /// Seconds since the response was produced.
    pub response_age: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Success(DispatchedResponse),
    Timeout { elapsed: Duration },
    Canceled { elapsed: Duration },
    BackendUnavailable { elapsed: Duration },
}

impl DispatchOutcome {
    /// Status reported to the client and in the record.
    pub fn status(&self) -> u16 {
        match self {
            DispatchOutcome::Success(response) => response.status.as_u16(),
            DispatchOutcome::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT.as_u16(),
            DispatchOutcome::Canceled { .. } => STATUS_CLIENT_CLOSED_REQUEST,
            DispatchOutcome::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY.as_u16(),
        }
    }

    /// Backend time for the record; a backend that never answered has none,
    /// except that timeouts and cancellations report the time waited.
    pub fn backend_response_time(&self) -> Option<Duration> {
        match self {
            DispatchOutcome::Success(response) => Some(response.backend_response_time),
            DispatchOutcome::Timeout { elapsed } | DispatchOutcome::Canceled { elapsed } => {
                Some(*elapsed)
            }
            DispatchOutcome::BackendUnavailable { .. } => None,
        }
    }

    pub fn response(&self) -> Option<&DispatchedResponse> {
        match self {
            DispatchOutcome::Success(response) => Some(response),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    client: Arc<dyn HttpClient>,
    cache: Option<ResponseCache>,
    response_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn HttpClient>,
        cache: Option<ResponseCache>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            response_timeout,
        }
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Forward `request` to `route`, going through the response cache for GET and HEAD.
    pub async fn dispatch(
        &self,
        request: BackendRequest,
        route: &Arc<BackendRoute>,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let cache = match &self.cache {
            Some(cache) if request.method == Method::GET || request.method == Method::HEAD => cache,
            _ => return self.dispatch_uncached(request, route, cancel).await,
        };

        let started = Instant::now();
        let key = CacheKey::new(
            request.method.as_str(),
            &format!("{}{}", route.api_name, route.frontend_prefix),
            &route.backend_host,
            &request.path_and_query,
        );
        let request_headers = request.headers.clone();
        let client = self.client.clone();
        let owned_route = route.clone();
        let timeout = self.response_timeout;
        let start_fetch = move || fetch(client, owned_route, request, timeout).boxed();

        let lookup = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return DispatchOutcome::Canceled { elapsed: started.elapsed() };
            }
            lookup = cache.get_or_fetch(key, &request_headers, start_fetch) => lookup,
        };

        let (result, joined) = match lookup {
            Lookup::Stored(response) => {
                metrics::increment_cache_result(CacheStatus::Hit.as_str());
                let age = response.age();
                return success(&response, Some(CacheStatus::Hit), Some(age), started.elapsed());
            }
            Lookup::Fetched(result) => (result, false),
            Lookup::Joined(result) => (result, true),
        };

        match result {
            Ok(response) if joined && response.is_cacheable() => {
                metrics::increment_cache_result(CacheStatus::Hit.as_str());
                let age = response.age();
                success(&response, Some(CacheStatus::Hit), Some(age), started.elapsed())
            }
            Ok(response) => {
                metrics::increment_cache_result(CacheStatus::Miss.as_str());
                let backend_time = if joined {
                    started.elapsed()
                } else {
                    response.backend_response_time
                };
                success(
                    &response,
                    Some(CacheStatus::Miss),
                    response.backend_age(),
                    backend_time,
                )
            }
            Err(failure) => failed(failure, started.elapsed()),
        }
    }

    /// Forward without consulting the cache. Cancellation drops the backend call.
    pub async fn dispatch_uncached(
        &self,
        request: BackendRequest,
        route: &Arc<BackendRoute>,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return DispatchOutcome::Canceled { elapsed: started.elapsed() };
            }
            result = fetch(self.client.clone(), route.clone(), request, self.response_timeout) => result,
        };
        match result {
            Ok(response) => success(&response, None, None, response.backend_response_time),
            Err(failure) => failed(failure, started.elapsed()),
        }
    }
}

fn success(
    response: &CachedResponse,
    cache_status: Option<CacheStatus>,
    response_age: Option<u64>,
    backend_response_time: Duration,
) -> DispatchOutcome {
    DispatchOutcome::Success(DispatchedResponse {
        status: response.status,
        backend_response_time,
        headers: response.headers.clone(),
        body: response.body.clone(),
        body_size: response.body.len() as u64,
        cache_status,
        response_age,
    })
}

fn failed(failure: FetchFailure, elapsed: Duration) -> DispatchOutcome {
    match failure {
        FetchFailure::Timeout => DispatchOutcome::Timeout { elapsed },
        FetchFailure::Unavailable => DispatchOutcome::BackendUnavailable { elapsed },
    }
}

/// One complete exchange, bounded by `timeout`.
async fn fetch(
    client: Arc<dyn HttpClient>,
    route: Arc<BackendRoute>,
    request: BackendRequest,
    timeout: Duration,
) -> FetchResult {
    let timer = metrics::BackendRequestTimer::new(&route.backend_host, request.method.as_str());
    match tokio::time::timeout(timeout, exchange(client.as_ref(), &route, &request)).await {
        Ok(Ok((status, headers, body))) => {
            metrics::increment_backend_request_total(
                &route.backend_host,
                request.method.as_str(),
                status.as_u16(),
            );
            Ok(Arc::new(
                CachedResponse::new(status, headers, body, timer.elapsed())
                    .for_request(&request.headers),
            ))
        }
        Ok(Err(failure)) => Err(failure),
        Err(_) => {
            tracing::warn!(
                backend = %route.backend_host,
                path = %request.path_and_query,
                timeout = ?timeout,
                "Backend response timed out"
            );
            Err(FetchFailure::Timeout)
        }
    }
}

async fn exchange(
    client: &dyn HttpClient,
    route: &BackendRoute,
    request: &BackendRequest,
) -> Result<(StatusCode, HeaderMap, Bytes), FetchFailure> {
    for index in route.balancer.attempt_order(route.servers.len()) {
        let server = &route.servers[index];
        let upstream = build_request(route, server, request).map_err(|e| {
            tracing::error!(error = %e, "Failed to build backend request");
            FetchFailure::Unavailable
        })?;

        match client.send_request(upstream).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|e| {
                        tracing::warn!(server = %server_addr(server), error = %e, "Backend body read failed");
                        FetchFailure::Unavailable
                    })?
                    .to_bytes();
                return Ok((parts.status, parts.headers, body));
            }
            Err(e) if e.is_retryable_connect() => {
                tracing::warn!(server = %server_addr(server), error = %e, "Backend server unreachable, trying next");
                metrics::increment_backend_connect_failure(&server_addr(server));
            }
            Err(HttpClientError::ConnectTimeout(after)) => {
                tracing::warn!(server = %server_addr(server), ?after, "Backend connect timed out");
                return Err(FetchFailure::Timeout);
            }
            Err(e) => {
                tracing::warn!(server = %server_addr(server), error = %e, "Backend exchange failed");
                return Err(FetchFailure::Unavailable);
            }
        }
    }
    tracing::error!(backend = %route.backend_host, "No backend server could be reached");
    Err(FetchFailure::Unavailable)
}

fn server_addr(server: &ServerConfig) -> String {
    format!("{}:{}", server.host, server.port)
}

fn build_request(
    route: &BackendRoute,
    server: &ServerConfig,
    request: &BackendRequest,
) -> Result<Request<AxumBody>, http::Error> {
    let uri = format!(
        "{}://{}{}",
        route.backend_protocol.scheme(),
        server_addr(server),
        request.path_and_query
    );
    let mut builder = Request::builder().method(request.method.clone()).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        headers.clone_from(&request.headers);
        if let Ok(host) = HeaderValue::from_str(&route.backend_host) {
            headers.insert(header::HOST, host);
        }
    }
    builder.body(AxumBody::from(request.body.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use hyper::Response;

    use super::*;
    use crate::{
        config::{ApiConfig, BackendProtocol, UrlMatchConfig},
        core::router::RouteTable,
        ports::http_client::HttpClientResult,
    };

    /// Refuses connections to port 1, otherwise answers after `delay`.
    /// Answers gzip-encoded when the request accepts exactly `gzip`.
    struct FakeBackend {
        delay: Duration,
        cache_control: &'static str,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for FakeBackend {
        async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
            if req.uri().port_u16() == Some(1) {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let gzip = req
                .headers()
                .get(header::ACCEPT_ENCODING)
                .is_some_and(|v| v.as_bytes() == b"gzip");
            let mut builder = Response::builder()
                .header(header::CACHE_CONTROL, self.cache_control)
                .header(header::VARY, "Accept-Encoding");
            if gzip {
                builder = builder.header(header::CONTENT_ENCODING, "gzip");
            }
            Ok(builder
                .body(AxumBody::from(format!("{} {}", host, req.uri().path())))
                .unwrap())
        }
    }

    fn backend(delay_ms: u64, cache_control: &'static str) -> Arc<FakeBackend> {
        Arc::new(FakeBackend {
            delay: Duration::from_millis(delay_ms),
            cache_control,
            hits: AtomicUsize::new(0),
        })
    }

    fn route(ports: &[u16]) -> Arc<BackendRoute> {
        let table = RouteTable::new(
            &[ApiConfig {
                name: "example".to_string(),
                frontend_host: "*".to_string(),
                backend_host: "example.com".to_string(),
                backend_protocol: BackendProtocol::Http,
                balance: Default::default(),
                servers: ports
                    .iter()
                    .map(|port| ServerConfig {
                        host: "127.0.0.1".to_string(),
                        port: *port,
                    })
                    .collect(),
                url_matches: vec![UrlMatchConfig {
                    frontend_prefix: "/".to_string(),
                    backend_prefix: "/".to_string(),
                }],
                settings: Default::default(),
            }],
            None,
        );
        table.routes()[0].clone()
    }

    fn get(path: &str) -> BackendRequest {
        BackendRequest {
            method: Method::GET,
            path_and_query: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn forwards_with_backend_host() {
        let client = backend(0, "no-store");
        let dispatcher = Dispatcher::new(client, None, Duration::from_secs(1));
        let outcome = dispatcher
            .dispatch(get("/info"), &route(&[8080]), &CancellationToken::new())
            .await;
        let response = outcome.response().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"example.com /info");
        assert_eq!(response.body_size, 17);
        assert_eq!(response.cache_status, None);
    }

    #[tokio::test]
    async fn skips_unreachable_servers() {
        let dispatcher = Dispatcher::new(backend(0, "no-store"), None, Duration::from_secs(1));
        let route = route(&[1, 8080]);
        for _ in 0..2 {
            let outcome = dispatcher
                .dispatch(get("/"), &route, &CancellationToken::new())
                .await;
            assert_eq!(outcome.status(), 200);
        }
    }

    #[tokio::test]
    async fn all_servers_down_is_unavailable() {
        let dispatcher = Dispatcher::new(backend(0, "no-store"), None, Duration::from_secs(1));
        let outcome = dispatcher
            .dispatch(get("/"), &route(&[1]), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, DispatchOutcome::BackendUnavailable { .. }));
        assert_eq!(outcome.status(), 502);
        assert!(outcome.backend_response_time().is_none());
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let dispatcher = Dispatcher::new(backend(500, "no-store"), None, Duration::from_millis(50));
        let outcome = dispatcher
            .dispatch(get("/"), &route(&[8080]), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status(), 504);
        let waited = outcome.backend_response_time().unwrap();
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancellation_is_immediate() {
        let dispatcher = Dispatcher::new(backend(2_000, "no-store"), None, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let outcome = dispatcher.dispatch(get("/"), &route(&[8080]), &cancel).await;
        assert_eq!(outcome.status(), 499);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cache_reports_miss_then_hit() {
        let client = backend(0, "max-age=60");
        let dispatcher = Dispatcher::new(
            client.clone(),
            Some(ResponseCache::new(100)),
            Duration::from_secs(1),
        );
        let route = route(&[8080]);
        let token = CancellationToken::new();
        let statuses: Vec<_> = {
            let mut statuses = Vec::new();
            for _ in 0..3 {
                let outcome = dispatcher.dispatch(get("/cached"), &route, &token).await;
                let response = outcome.response().unwrap();
                statuses.push(response.cache_status);
                if response.cache_status == Some(CacheStatus::Hit) {
                    assert!(response.response_age.is_some());
                }
            }
            statuses
        };
        assert_eq!(
            statuses,
            vec![Some(CacheStatus::Miss), Some(CacheStatus::Hit), Some(CacheStatus::Hit)]
        );
        assert_eq!(client.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn posts_bypass_the_cache() {
        let client = backend(0, "max-age=60");
        let dispatcher = Dispatcher::new(
            client.clone(),
            Some(ResponseCache::new(100)),
            Duration::from_secs(1),
        );
        let route = route(&[8080]);
        for _ in 0..2 {
            let mut request = get("/cached");
            request.method = Method::POST;
            let outcome = dispatcher
                .dispatch(request, &route, &CancellationToken::new())
                .await;
            assert_eq!(outcome.response().unwrap().cache_status, None);
        }
        assert_eq!(client.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_keeps_each_encoding_separate() {
        let client = backend(0, "max-age=60");
        let dispatcher = Dispatcher::new(
            client.clone(),
            Some(ResponseCache::new(100)),
            Duration::from_secs(1),
        );
        let route = route(&[8080]);
        let token = CancellationToken::new();
        let gzip = || {
            let mut request = get("/negotiated");
            request
                .headers
                .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
            request
        };

        let first = dispatcher.dispatch(gzip(), &route, &token).await;
        let first = first.response().unwrap();
        assert_eq!(first.cache_status, Some(CacheStatus::Miss));
        assert_eq!(first.headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");

        let plain = dispatcher.dispatch(get("/negotiated"), &route, &token).await;
        let plain = plain.response().unwrap();
        assert_eq!(plain.cache_status, Some(CacheStatus::Miss));
        assert!(plain.headers.get(header::CONTENT_ENCODING).is_none());

        for (request, encoded) in [(gzip(), true), (get("/negotiated"), false)] {
            let outcome = dispatcher.dispatch(request, &route, &token).await;
            let response = outcome.response().unwrap();
            assert_eq!(response.cache_status, Some(CacheStatus::Hit));
            assert_eq!(response.headers.contains_key(header::CONTENT_ENCODING), encoded);
        }
        assert_eq!(client.hits.load(Ordering::SeqCst), 2);
    }
}
