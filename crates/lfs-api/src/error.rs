//! Error types for the batch API client.

use http::StatusCode;
use thiserror::Error;

/// Errors produced by an [`HttpClient`](crate::HttpClient) backend.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Any other transport-level error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Meaning of a batch-level HTTP status, per the batch API taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// 401: credentials are required or were rejected.
    CredentialsRequired,
    /// 403: the repository grants read-only access.
    ReadOnly,
    /// 404: the object or repository does not exist.
    NotFound,
    /// 406: the server rejected the accept header.
    WrongAcceptHeader,
    /// 409: the requested hash algorithm is unsupported.
    UnsupportedHashAlgorithm,
    /// 410: the object has been removed.
    Removed,
    /// 413: the batch exceeded the server's size limit.
    BatchTooLarge,
    /// 422: the request failed validation.
    ValidationFailed,
    /// 429: the client is being rate limited.
    RateLimited,
    /// 501: the server does not implement the operation.
    Unimplemented,
    /// 507: the server is out of storage.
    InsufficientStorage,
    /// 509: the bandwidth limit has been exceeded.
    BandwidthExceeded,
    /// Any status outside the taxonomy.
    Other(u16),
}

impl BatchStatus {
    /// Classify an HTTP status code.
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => Self::CredentialsRequired,
            403 => Self::ReadOnly,
            404 => Self::NotFound,
            406 => Self::WrongAcceptHeader,
            409 => Self::UnsupportedHashAlgorithm,
            410 => Self::Removed,
            413 => Self::BatchTooLarge,
            422 => Self::ValidationFailed,
            429 => Self::RateLimited,
            501 => Self::Unimplemented,
            507 => Self::InsufficientStorage,
            509 => Self::BandwidthExceeded,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::CredentialsRequired => "credentials required",
            Self::ReadOnly => "read-only access",
            Self::NotFound => "object or repository absent",
            Self::WrongAcceptHeader => "wrong accept header",
            Self::UnsupportedHashAlgorithm => "unsupported hash algorithm",
            Self::Removed => "object removed",
            Self::BatchTooLarge => "batch too large",
            Self::ValidationFailed => "validation failure",
            Self::RateLimited => "rate limited",
            Self::Unimplemented => "unimplemented",
            Self::InsufficientStorage => "insufficient server storage",
            Self::BandwidthExceeded => "bandwidth exceeded",
            Self::Other(_) => "unclassified status",
        };
        f.write_str(text)
    }
}

/// Errors from a batch metadata exchange.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The endpoint answered with a non-success HTTP status.
    #[error("batch endpoint returned {status} ({meaning}){}", fmt_message(.message))]
    Status {
        /// Raw HTTP status code.
        status: u16,
        /// Taxonomy classification of the status.
        meaning: BatchStatus,
        /// Server-provided message, if the body carried one.
        message: Option<String>,
    },
    /// A 2xx response carrying a top-level error message.
    #[error("batch endpoint message: {0}")]
    Server(String),
    /// The response did not have the shape of a batch response.
    #[error("malformed batch response: {0}")]
    Protocol(String),
    /// Transport-level failure.
    #[error("http transport: {0}")]
    Http(#[from] HttpClientError),
    /// The response body was not valid JSON for the expected models.
    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),
}

fn fmt_message(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

/// Errors from a ranged object download.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The download URL answered with a non-success HTTP status.
    #[error("range request returned {0}")]
    Status(u16),
    /// A per-object header from the batch response was not valid HTTP.
    #[error("invalid transfer header {0:?}")]
    InvalidHeader(String),
    /// Transport-level failure.
    #[error("http transport: {0}")]
    Http(#[from] HttpClientError),
}
