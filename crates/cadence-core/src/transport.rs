//! HTTP transport abstraction
//!
//! The core only depends on `HttpTransport`; `ReqwestTransport` is the
//! default backend.

use crate::{config::EngineConfig, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};
use url::Url;

/// A single GET request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    /// Inclusive byte range
    pub range: Option<(u64, u64)>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self { url, range: None }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }
}

/// Response with the status code as reported by the server
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8, used for error hints and manifest text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failures below the HTTP status layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established or was reset
    Connect(String),
    /// Request or body read timed out
    Timeout,
    /// Response body ended early
    UnexpectedEof,
    /// Anything else reported by the backend
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "connect: {}", msg),
            TransportError::Timeout => write!(f, "timeout"),
            TransportError::UnexpectedEof => write!(f, "unexpected end of stream"),
            TransportError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Perform a request and report the status or a transport error
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn fetch(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self), fields(url = %request.url))]
    async fn fetch(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(request.url.clone());
        if let Some((start, end)) = request.range {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end));
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        debug!(status, bytes = body.len(), "Response received");

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        TransportError::UnexpectedEof
    } else {
        TransportError::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_range() {
        assert!(HttpResponse::ok("x").is_success());
        assert!(HttpResponse::status(206, "x").is_success());
        assert!(!HttpResponse::status(404, "").is_success());
    }

    #[test]
    fn test_request_range() {
        let url = Url::parse("https://cdn.example.com/a.mp4").unwrap();
        let req = HttpRequest::get(url).with_range(0, 1023);
        assert_eq!(req.range, Some((0, 1023)));
    }

    #[test]
    fn test_reqwest_transport_builds() {
        assert!(ReqwestTransport::new(&EngineConfig::default()).is_ok());
    }
}
