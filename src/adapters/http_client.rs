use std::{error::Error as StdError, io, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tracing::Instrument;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Bounds every connection attempt by the configured connect timeout
/// * Forces request version to HTTP/1.1 while allowing ALPN to negotiate h2
/// * Tells apart refused connections, connect timeouts and failures after the
///   request was sent, so the dispatcher knows whether another server may be tried
/// * Converts between Hyper body and Axum body types
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    connect_timeout: Duration,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(connect_timeout));
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::info!(?connect_timeout, "Created backend HTTP client");
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    fn classify(&self, error: &hyper_util::client::legacy::Error) -> HttpClientError {
        if !error.is_connect() {
            return HttpClientError::BackendIo(error.to_string());
        }
        let mut source: Option<&(dyn StdError + 'static)> = error.source();
        while let Some(cause) = source {
            if let Some(io_error) = cause.downcast_ref::<io::Error>() {
                if io_error.kind() == io::ErrorKind::TimedOut {
                    return HttpClientError::ConnectTimeout(self.connect_timeout);
                }
            }
            source = cause.source();
        }
        HttpClientError::ConnectionError(error.to_string())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let span = tracing::debug_span!(
            "backend_request",
            backend.url = %req.uri(),
            http.method = %req.method(),
            http.status_code = tracing::field::Empty,
        );

        let (mut parts, axum_body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing_request = Request::from_parts(parts, axum_body);
        let method = outgoing_request.method().clone();
        let uri = outgoing_request.uri().clone();

        match self
            .client
            .request(outgoing_request)
            .instrument(span.clone())
            .await
        {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                let (parts, hyper_body) = response.into_parts();
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                let error = self.classify(&e);
                tracing::debug!("Request {} {} failed: {}", method, uri, error);
                Err(error)
            }
        }
    }
}
