//! Error types for the blobstore SDK.

use http::StatusCode;
use thiserror::Error;

/// Transport-level failures from an [`HttpClient`] backend.
///
/// [`HttpClient`]: crate::HttpClient
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The request could not reach the server.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other backend failure.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Failures of object-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The HTTP transport failed.
    #[error("HTTP transport error: {0}")]
    Http(#[from] HttpClientError),

    /// The request could not be constructed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server answered with an unexpected status.
    #[error("unexpected status {status} from {operation}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
    },

    /// The server's answer did not carry the part's ETag.
    #[error("response from {operation} is missing an ETag")]
    MissingEtag { operation: &'static str },

    /// Local file IO around a store operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
