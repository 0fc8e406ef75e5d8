//! Heimdall error types

use std::time::Duration;

use crate::types::EndpointClass;

/// Heimdall error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum HeimdallError {
    // Admission errors (no network attempt made)
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("upstream unavailable for {endpoint}, retry after {retry_after:?}")]
    UpstreamUnavailable {
        endpoint: EndpointClass,
        retry_after: Duration,
    },

    // Terminal upstream errors
    #[error("upstream error{}: {message}", status_suffix(.status))]
    UpstreamError {
        status: Option<u16>,
        message: String,
    },

    #[error("timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    // Caller errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Per-attempt transport errors. The executor folds these into the
    // terminal variants above before anything reaches a caller.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("attempt timed out after {0:?}")]
    AttemptTimedOut(Duration),

    #[error("no pooled connection available within {0:?}")]
    PoolTimeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl HeimdallError {
    /// Whether a retry of the same attempt may succeed.
    ///
    /// Timeouts, connection errors, upstream 5xx and upstream 429 are
    /// transient. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            HeimdallError::Http(_)
            | HeimdallError::AttemptTimedOut(_)
            | HeimdallError::PoolTimeout(_) => true,
            HeimdallError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether this failure is a signal about upstream health.
    ///
    /// Client errors (including upstream 429) are the caller's problem and
    /// never trip the circuit breaker. Neither does pool exhaustion, which
    /// is local congestion rather than upstream trouble.
    pub fn counts_against_breaker(&self) -> bool {
        match self {
            HeimdallError::Http(_) | HeimdallError::AttemptTimedOut(_) => true,
            HeimdallError::Api { status, .. } => *status >= 500,
            HeimdallError::UpstreamError { status, .. } => status.is_some_and(|s| s >= 500),
            HeimdallError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Server-provided or locally computed wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HeimdallError::RateLimited { retry_after } => Some(*retry_after),
            HeimdallError::UpstreamUnavailable { retry_after, .. } => Some(*retry_after),
            HeimdallError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Fold an exhausted per-attempt error into the caller-facing taxonomy.
    pub(crate) fn into_terminal(self, attempts: u32) -> Self {
        match self {
            HeimdallError::Http(_)
            | HeimdallError::AttemptTimedOut(_)
            | HeimdallError::PoolTimeout(_) => HeimdallError::Timeout { attempts },
            HeimdallError::Api {
                status, message, ..
            } => HeimdallError::UpstreamError {
                status: Some(status),
                message,
            },
            HeimdallError::Malformed(message) => HeimdallError::UpstreamError {
                status: None,
                message,
            },
            other => other,
        }
    }
}

impl From<reqwest::Error> for HeimdallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HeimdallError::AttemptTimedOut(Duration::ZERO)
        } else if err.is_decode() {
            HeimdallError::Malformed(err.to_string())
        } else {
            HeimdallError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HeimdallError {
    fn from(err: serde_json::Error) -> Self {
        HeimdallError::Malformed(err.to_string())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Result type alias for Heimdall operations
pub type Result<T> = std::result::Result<T, HeimdallError>;
