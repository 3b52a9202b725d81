use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Fully buffered response of a health probe.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ProbeResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn with_json(mut self, body: impl Into<Bytes>) -> Self {
        self.content_type = Some("application/json".to_string());
        self.body = body.into();
        self
    }
}

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend instance
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send, with an absolute URI
    ///
    /// # Returns
    /// A future that resolves to the backend's response or an error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Issue a health probe (`GET`) and buffer the response
    ///
    /// # Arguments
    /// * `url` - The health endpoint URL
    /// * `timeout` - Upper bound for the whole exchange, body included
    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<ProbeResponse>;
}
