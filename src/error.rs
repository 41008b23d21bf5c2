//! Error types for llm-relay
//!
//! Only [`Error::Cancelled`] is meant to escape a provider call. Every other
//! variant is folded into a failed [`GenerationResult`](crate::GenerationResult)
//! at the call boundary and classified with [`FailureKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error (connect, reset, body read)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Required credential, endpoint or field is absent
    #[error("Missing configuration: {0}")]
    Config(String),

    /// Backend answered with a non-2xx status
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Backend reported an error inside an otherwise healthy stream
    #[error("Backend error: {0}")]
    Backend(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Stream finished without any usable text or tool call
    #[error("Empty response from {0}")]
    EmptyResponse(String),

    /// A tool-call payload was cut off before it closed
    #[error("Response truncated before the tool call was complete")]
    Truncated { partial: String },

    /// No JSON of the requested kind could be extracted
    #[error("Could not extract a JSON {kind} from response: {excerpt}")]
    Parse { kind: String, excerpt: String },

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

/// Classification carried by failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Credential/endpoint absent. Never retried.
    ConfigurationMissing,
    /// Timeout, connection reset, 5xx, rate limiting.
    Transient,
    /// Non-2xx response with a body, or an in-stream backend error.
    Protocol,
    /// Stream produced zero usable content.
    EmptyResponse,
    /// Output was cut off mid tool call.
    Truncated,
    /// No JSON of the requested kind in the response.
    Parse,
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Error::Api {
            status,
            body: body.into(),
        }
    }

    /// Create a new in-stream backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Error::Backend(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Map the error onto the failure taxonomy.
    ///
    /// `Cancelled` has no failure kind: it is never turned into a result.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        let kind = match self {
            Error::Cancelled => return None,
            Error::Config(_) => FailureKind::ConfigurationMissing,
            Error::Http(_) | Error::Timeout => FailureKind::Transient,
            Error::Api { status, .. } if *status >= 500 || *status == 429 => {
                FailureKind::Transient
            }
            Error::Api { .. } | Error::Backend(_) | Error::Json(_) => FailureKind::Protocol,
            Error::Stream(_) => FailureKind::Transient,
            Error::EmptyResponse(_) => FailureKind::EmptyResponse,
            Error::Truncated { .. } => FailureKind::Truncated,
            Error::Parse { .. } => FailureKind::Parse,
            Error::Other(_) => FailureKind::Protocol,
        };
        Some(kind)
    }
}
