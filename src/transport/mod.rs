//! HTTP transport seam.
//!
//! Everything above this module talks to GitHub through [`HttpTransport`], so
//! tests can swap in [`crate::mocks::MockTransport`] while production uses
//! [`ReqwestTransport`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use url::Url;

use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};

/// HTTP transport abstraction for testability.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and buffers the full response.
    async fn send(&self, request: HttpRequest) -> GitHubResult<HttpResponse>;
}

/// HTTP request representation.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Request URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Adds a header, rejecting values that are not valid header text.
    pub fn with_header(mut self, name: &'static str, value: &str) -> GitHubResult<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::InvalidConfiguration,
                format!("Invalid value for header {}: {}", name, e),
            )
            .local()
        })?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    /// Sets a JSON body.
    pub fn with_json_body(mut self, body: Bytes) -> Self {
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(body);
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a new HTTP response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Reads a header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Reqwest-based HTTP transport implementation.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wraps an existing reqwest client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client with the given default timeout.
    pub fn with_timeout(timeout: Duration) -> GitHubResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| {
                GitHubError::configuration(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> GitHubError {
    let kind = if err.is_timeout() {
        GitHubErrorKind::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        GitHubErrorKind::TransientNetwork
    } else {
        GitHubErrorKind::Unknown
    };
    GitHubError::new(kind, format!("HTTP transport failure: {}", err)).with_cause(err)
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> GitHubResult<HttpResponse> {
        let mut req = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }

        let response = req.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://api.github.com/repos/o/r").unwrap();
        let request = HttpRequest::new(Method::GET, url)
            .with_header("if-none-match", "\"abc\"")
            .unwrap()
            .with_json_body(Bytes::from_static(b"{}"));

        assert_eq!(request.headers.get("if-none-match").unwrap(), "\"abc\"");
        assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
        assert!(request.body.is_some());
    }

    #[test]
    fn test_rejects_invalid_header_value() {
        let url = Url::parse("https://api.github.com/").unwrap();
        let err = HttpRequest::new(Method::GET, url)
            .with_header("authorization", "bad\nvalue")
            .unwrap_err();
        assert!(err.is_local());
    }
}
