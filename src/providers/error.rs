use std::time::Duration;
use thiserror::Error;

/// Provider-specific errors raised by a [`ModelClient`](super::ModelClient).
///
/// Each variant maps to a stable, normalized kind code (see [`ProviderError::kind`])
/// which is what the classifier keys on.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Input exceeds model context: {0}")]
    ContextLengthExceeded(String),

    #[error("Response failed validation: {0}")]
    SchemaValidation(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Provider API error: {status} - {message}")]
    Upstream { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Error from a client the resilience layer has no mapping for.
    /// `kind` is passed through to the classifier verbatim.
    #[error("{kind}: {message}")]
    Other { kind: String, message: String },
}

impl ProviderError {
    /// Normalized error kind code.
    pub fn kind(&self) -> &str {
        match self {
            ProviderError::Authentication(_) => "authentication",
            ProviderError::PermissionDenied(_) => "permission_denied",
            ProviderError::QuotaExceeded(_) => "quota_exceeded",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Connection(_) => "connection",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::ContextLengthExceeded(_) => "context_length_exceeded",
            ProviderError::SchemaValidation(_) => "schema_validation",
            ProviderError::ServiceUnavailable(_) => "service_unavailable",
            ProviderError::Upstream { .. } => "upstream",
            ProviderError::HttpError(e) => {
                if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() || e.is_request() {
                    "connection"
                } else if e.is_decode() {
                    "schema_validation"
                } else {
                    "upstream"
                }
            }
            ProviderError::SerializationError(_) => "schema_validation",
            ProviderError::Other { kind, .. } => kind.as_str(),
        }
    }

    /// Server-provided hint for when the request may be retried.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
