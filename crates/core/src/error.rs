//! Error taxonomy shared across the workspace.
//!
//! Errors are grouped by the failure class the caller reacts to: whether a
//! request can be retried, reported back to the user, or only logged.

use thiserror::Error;

/// Failures talking to the inference backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection-level failure (refused, reset, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status from the backend
    #[error("Upstream returned {status_code}: {message}")]
    Status { status_code: u16, message: String },

    /// Request or probe exceeded its deadline
    #[error("Upstream timeout: {0}")]
    Timeout(String),

    /// Response body could not be decoded
    #[error("Invalid upstream response: {0}")]
    Decode(String),

    /// Caller cancelled while a request or backoff wait was in flight
    #[error("Request cancelled")]
    Cancelled,

    /// Streaming response ended before the final chunk
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl UpstreamError {
    /// Whether retrying the same request may succeed.
    ///
    /// Network failures, timeouts and 5xx responses are transient; 4xx
    /// responses mean the request itself is wrong and must not be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Network(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::Status { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

/// Rejections of the caller's input before any side effect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    Empty,

    #[error("Message exceeds {max} characters (got {len})")]
    TooLong { len: usize, max: usize },
}

/// Failures from the conversation/knowledge persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Denied(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Failures from the URL text extraction collaborator.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Unsupported content: {0}")]
    Unsupported(String),
}

/// Top-level error for the chat pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
