//! Shared harness: a mock backend and a gateway wired to an in-memory sink.
#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::IntoResponse,
    routing::{any, get},
};
use gatehouse::{
    GatewayService, HttpClientAdapter, HttpHandler, MemoryLogSink,
    adapters::router,
    config::{
        AdminConfig, ApiConfig, ApiSettings, ApiUserConfig, GatewayConfig, HeaderList,
        RateLimitConfig, ServerConfig, UrlMatchConfig,
    },
};
use tokio::net::TcpListener;

pub const TEST_KEY: &str = "TESTING_KEY";
pub const DISABLED_KEY: &str = "DISABLED_KEY";
pub const LIMITED_KEY: &str = "LIMITED_KEY";

#[derive(Clone, Default)]
struct BackendState {
    cacheable_hits: Arc<AtomicUsize>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    cacheable_hits: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Number of requests that reached `/cacheable`.
    pub fn cacheable_hits(&self) -> usize {
        self.cacheable_hits.load(Ordering::SeqCst)
    }
}

async fn hello() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "Hello World")
}

async fn delay(Path(ms): Path<u64>) -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "done"
}

async fn cacheable(State(state): State<BackendState>) -> impl IntoResponse {
    state.cacheable_hits.fetch_add(1, Ordering::SeqCst);
    // Long enough for concurrent callers to pile up on one fetch.
    tokio::time::sleep(Duration::from_millis(300)).await;
    (
        [
            (header::CACHE_CONTROL, "max-age=60"),
            (header::CONTENT_TYPE, "text/plain"),
        ],
        "cached body",
    )
}

async fn echo_headers(headers: HeaderMap) -> Json<BTreeMap<String, String>> {
    let echoed = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    Json(echoed)
}

async fn info() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::SERVER, "mock-backend"),
        ],
        [("x-override", "backend")],
        "info",
    )
}

async fn admin(Path(rest): Path<String>) -> String {
    format!("admin:{rest}")
}

pub async fn spawn_backend() -> MockBackend {
    let state = BackendState::default();
    let app = Router::new()
        .route("/hello", get(hello))
        .route("/delay/{ms}", get(delay))
        .route("/cacheable", get(cacheable))
        .route("/headers", any(echo_headers))
        .route("/info", get(info))
        .route("/admin/{*rest}", any(admin))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockBackend {
        addr,
        cacheable_hits: state.cacheable_hits,
    }
}

/// A local port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn server(addr: SocketAddr) -> ServerConfig {
    ServerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

fn url_match(frontend: &str, backend: &str) -> UrlMatchConfig {
    UrlMatchConfig {
        frontend_prefix: frontend.to_string(),
        backend_prefix: backend.to_string(),
    }
}

pub fn api(name: &str, frontend_host: &str, servers: Vec<ServerConfig>, matches: &[(&str, &str)]) -> ApiConfig {
    ApiConfig {
        name: name.to_string(),
        frontend_host: frontend_host.to_string(),
        backend_host: "example.com".to_string(),
        backend_protocol: Default::default(),
        balance: Default::default(),
        servers,
        url_matches: matches.iter().map(|(f, b)| url_match(f, b)).collect(),
        settings: ApiSettings::default(),
    }
}

/// Catch-all API in front of `backend`, a dead API under `/dead/` and the
/// admin application, plus three users.
pub fn config(backend: &MockBackend) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.timeouts.connect = "1s".to_string();
    config.timeouts.response = "1s".to_string();
    config.trusted_proxies = vec!["127.0.0.1".to_string()];

    let mut example = api("example", "*", vec![server(backend.addr)], &[("/", "/")]);
    example.settings.headers = HeaderList::parse_lines("X-Add1: test1\nX-Add2: test2");
    example.settings.default_response_headers =
        HeaderList::parse_lines("X-Default: default\nContent-Type: text/override");
    example.settings.override_response_headers = HeaderList::parse_lines("X-Override: gateway");

    let dead = api(
        "dead",
        "*",
        vec![ServerConfig {
            host: "127.0.0.1".to_string(),
            port: closed_port(),
        }],
        &[("/dead/", "/")],
    );
    config.apis = vec![example, dead];

    config.admin = Some(AdminConfig {
        backend_host: "admin.internal".to_string(),
        backend_protocol: Default::default(),
        servers: vec![server(backend.addr)],
    });

    config.api_users = vec![
        ApiUserConfig {
            api_key: TEST_KEY.to_string(),
            id: "user-1".to_string(),
            email: Some("user1@example.com".to_string()),
            registration_source: Some("web".to_string()),
            disabled: false,
            rate_limit: None,
        },
        ApiUserConfig {
            api_key: DISABLED_KEY.to_string(),
            id: "user-2".to_string(),
            email: None,
            registration_source: None,
            disabled: true,
            rate_limit: None,
        },
        ApiUserConfig {
            api_key: LIMITED_KEY.to_string(),
            id: "user-3".to_string(),
            email: None,
            registration_source: None,
            disabled: false,
            rate_limit: Some(RateLimitConfig {
                requests: 2,
                period: "1m".to_string(),
            }),
        },
    ];
    config
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub sink: Arc<MemoryLogSink>,
    pub service: Arc<GatewayService>,
}

impl TestGateway {
    pub fn url(&self, target: &str) -> String {
        format!("http://{}{}", self.addr, target)
    }
}

pub async fn spawn_gateway(config: GatewayConfig) -> TestGateway {
    let sink = Arc::new(MemoryLogSink::new());
    let connect = config.timeouts.connect_duration().unwrap();
    let client = Arc::new(HttpClientAdapter::new(connect).unwrap());
    let service = Arc::new(GatewayService::new(config, client, sink.clone()).unwrap());

    let app = router(HttpHandler::new(service.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway {
        addr,
        sink,
        service,
    }
}

/// Client that reports redirects instead of following them.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Poll until the sink holds `count` records.
pub async fn wait_for_count(sink: &MemoryLogSink, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sink.len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} records, have {}",
            sink.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
