//! HTTP client abstraction for pluggable backends.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::HttpClientError;

/// An HTTP request to be sent by an [`HttpClient`] implementation.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: Method,
    /// The fully-qualified URL.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<Bytes>,
}

/// An HTTP response returned by an [`HttpClient`] implementation.
#[derive(Debug)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body bytes.
    pub body: Bytes,
}

/// Trait for pluggable blocking HTTP client backends.
///
/// A handle is owned by one worker thread for that thread's lifetime and
/// reused across requests; [`HttpClient::reset`] runs before every job and
/// must leave no per-request state behind. Connection caches are expected
/// to survive a reset and die with the handle.
pub trait HttpClient: Send + 'static {
    /// Send an HTTP request and return the response.
    fn send(&mut self, request: HttpRequest) -> Result<HttpResponse, HttpClientError>;

    /// Clear per-request state before the handle is reused.
    fn reset(&mut self) {}
}
