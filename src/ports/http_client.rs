use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The connection was refused or could not be established; nothing was sent.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Establishing the connection took longer than the connect timeout.
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request reached the backend but the exchange failed.
    #[error("Backend exchange failed: {0}")]
    BackendIo(String),
}

impl HttpClientError {
    /// True when no byte of the request left the gateway, so another server may be tried.
    pub fn is_retryable_connect(&self) -> bool {
        matches!(self, HttpClientError::ConnectionError(_))
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server and return the response head
    /// with a streaming body.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
