//! Axum side of the gateway: turns an incoming `Request` into an
//! [`InboundRequest`] and runs the pipeline in its own task.
//!
//! The pipeline task outlives the connection on purpose: when the client goes
//! away axum drops the handler future, the drop guard cancels the token and
//! the dispatcher answers `499`, but the analytics record is still written by
//! the detached task.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode, header},
    middleware,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::Response;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    adapters::middleware::{request_id_middleware, request_timing_middleware},
    core::{GatewayService, gateway::InboundRequest},
};

/// HTTP handler for the Gatehouse API gateway
#[derive(Clone)]
pub struct HttpHandler {
    gateway_service: Arc<GatewayService>,
    listener_scheme: &'static str,
}

impl HttpHandler {
    pub fn new(gateway_service: Arc<GatewayService>) -> Self {
        Self {
            gateway_service,
            listener_scheme: "http",
        }
    }

    /// Scheme reported for requests that did not come through a trusted
    /// proxy. Set to `https` when a TLS terminator sits in front of the
    /// listener on the same host.
    pub fn with_listener_scheme(mut self, scheme: &'static str) -> Self {
        self.listener_scheme = scheme;
        self
    }

    pub fn gateway_service(&self) -> &Arc<GatewayService> {
        &self.gateway_service
    }

    /// Read the body, then hand the request to the pipeline task.
    pub async fn handle_request(&self, req: Request, peer: SocketAddr) -> Response<AxumBody> {
        let limit = self
            .gateway_service
            .snapshot()
            .config
            .limits
            .max_request_body;
        let (mut parts, body) = req.into_parts();

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared.is_some_and(|length| length > limit) {
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
        }

        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::warn!(%peer, limit, "Request body over limit");
                return plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
            }
            Err(e) => {
                tracing::debug!(%peer, "Failed to read request body: {}", e);
                return plain(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        // HTTP/2 carries the host in the :authority pseudo header.
        if !parts.headers.contains_key(header::HOST) {
            if let Some(value) = parts
                .uri
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
            {
                parts.headers.insert(header::HOST, value);
            }
        }

        let inbound = InboundRequest {
            method: parts.method,
            target: parts
                .uri
                .path_and_query()
                .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
            version: parts.version,
            headers: parts.headers,
            body,
            peer,
            listener_scheme: self.listener_scheme,
        };

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let gateway = self.gateway_service.clone();
        let task = tokio::spawn(
            async move { gateway.handle(inbound, cancel).await }.in_current_span(),
        );

        let result = task.await;
        guard.disarm();
        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Request pipeline task failed: {}", e);
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response
}

/// Every path and method goes to the gateway; routing happens in the core.
pub fn router(handler: HttpHandler) -> Router {
    Router::new()
        .fallback(
            move |ConnectInfo(peer): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move { handler.handle_request(req, peer).await }
            },
        )
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use axum::{body::Body, extract::connect_info::MockConnectInfo};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::{HttpClientAdapter, log_sinks::MemoryLogSink},
        config::{ApiConfig, ApiSettings, GatewayConfig, ServerConfig, UrlMatchConfig},
    };

    fn handler(sink: Arc<MemoryLogSink>) -> HttpHandler {
        let mut config = GatewayConfig::default();
        config.limits.max_request_body = 16;
        config.apis.push(ApiConfig {
            name: "closed".to_string(),
            frontend_host: "gateway.test".to_string(),
            backend_host: "backend.test".to_string(),
            backend_protocol: Default::default(),
            balance: Default::default(),
            servers: vec![ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
            }],
            url_matches: vec![UrlMatchConfig {
                frontend_prefix: "/".to_string(),
                backend_prefix: "/".to_string(),
            }],
            settings: ApiSettings {
                disable_api_key: true,
                ..Default::default()
            },
        });
        let client = Arc::new(HttpClientAdapter::new(Duration::from_secs(1)).unwrap());
        let service = GatewayService::new(config, client, sink).unwrap();
        HttpHandler::new(Arc::new(service))
    }

    fn app(sink: Arc<MemoryLogSink>) -> Router {
        let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, 40000));
        router(handler(sink)).layer(MockConnectInfo(peer))
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_without_record() {
        let sink = Arc::new(MemoryLogSink::new());
        let response = app(sink.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload?id=big")
                    .header("host", "gateway.test")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_host_logged_as_not_found() {
        let sink = Arc::new(MemoryLogSink::new());
        let response = app(sink.clone())
            .oneshot(
                Request::builder()
                    .uri("/anything?id=nf")
                    .header("host", "nowhere.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
        let record = sink.find("id", "nf").unwrap();
        assert_eq!(record.response_status, 404);
    }

    #[tokio::test]
    async fn test_dead_backend_is_bad_gateway() {
        let sink = Arc::new(MemoryLogSink::new());
        let response = app(sink.clone())
            .oneshot(
                Request::builder()
                    .uri("/hello?id=dead")
                    .header("host", "gateway.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let record = sink.find("id", "dead").unwrap();
        assert!(record.is_full());
    }
}
