//! Classified error shape for every call made through the pipeline
//!
//! Only the pipeline's response stages turn a raw transport outcome into
//! one of these variants; every other component consumes the classified
//! form.

/// Errors surfaced to callers of the request pipeline.
///
/// `Clone` so that one refresh failure can be broadcast to every queued call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No response received (connection refused, DNS, per-call timeout).
    #[error("network error: {message}")]
    Network { message: String, timed_out: bool },

    /// Backend answered 5xx.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The session could not be refreshed; the caller must log in again.
    #[error("session expired: {0}")]
    AuthExpired(String),

    /// Backend rejected the request (4xx other than an expired token).
    #[error("request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    /// A 2xx payload did not match the type the caller asked for.
    #[error("unexpected response payload: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether `RetryPolicy` may attempt the operation again.
    ///
    /// Network failures and 5xx are transient. Rejections, decode failures
    /// and expired sessions are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network { .. } | ApiError::Server { .. })
    }

    /// HTTP status for errors that carry one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } | ApiError::Validation { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network { timed_out: true, .. } => "timeout",
            ApiError::Network { .. } => "network",
            ApiError::Server { .. } => "server",
            ApiError::AuthExpired(_) => "auth_expired",
            ApiError::Validation { .. } => "validation",
            ApiError::Decode(_) => "decode",
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ApiError>;
