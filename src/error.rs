//! Error types for the grouping pipeline.
//!
//! Errors are classified by recoverability:
//! - Transient: network issues, timeouts, provider 5xx; queue retries with backoff
//! - RateLimited: explicit budget refusal; deferred visibility, not a retry
//! - RequiresUserAction: expired credentials, exhausted quota
//! - Permanent: everything a retry cannot fix

use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    // Retryable errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Provider error {status}: {message}")]
    Provider { status: u16, message: String },

    // Budget refusal, recovered by deferring visibility rather than immediate retry
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    // Requires user action
    #[error("Credentials expired or revoked")]
    AuthExpired,

    #[error("Provider quota exhausted")]
    QuotaExceeded,

    // Permanent errors
    #[error("Extractor output did not match schema: {0}")]
    ExtractionParse(String),

    #[error("Resolver conflict: {0}")]
    ResolverConflict(String),

    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("Configuration error: {0}")]
    FatalConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether a queue worker should fail the item as retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Network(_) | CoreError::Timeout(_) | CoreError::RateLimited { .. } => true,
            CoreError::Provider { status, .. } => *status >= 500,
            CoreError::PersistenceConflict(_) => true,
            _ => false,
        }
    }

    /// Whether the owning user's workers should be paused until re-consent.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, CoreError::AuthExpired | CoreError::QuotaExceeded)
    }

    /// Delay hint for retryable failures, if the provider supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::Network("reset".into()).is_retryable());
        assert!(CoreError::Timeout(30).is_retryable());
        assert!(CoreError::RateLimited {
            retry_after: Duration::from_secs(2)
        }
        .is_retryable());
        assert!(CoreError::Provider {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!CoreError::Provider {
            status: 404,
            message: "gone".into()
        }
        .is_retryable());
        assert!(!CoreError::ExtractionParse("bad json".into()).is_retryable());
        assert!(!CoreError::AuthExpired.is_retryable());
    }

    #[test]
    fn test_requires_user_action() {
        assert!(CoreError::AuthExpired.requires_user_action());
        assert!(CoreError::QuotaExceeded.requires_user_action());
        assert!(!CoreError::Network("x".into()).requires_user_action());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = CoreError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(CoreError::AuthExpired.retry_after(), None);
    }
}
