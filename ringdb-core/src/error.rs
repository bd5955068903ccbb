//! Error types for RingDB

use thiserror::Error;

/// Result type alias for RingDB operations
pub type Result<T> = std::result::Result<T, RingError>;

/// RingDB error kinds
///
/// One variant per error kind of the public contract. The HTTP layer maps
/// kinds to status codes via [`RingError::kind_code`].
#[derive(Error, Debug)]
pub enum RingError {
    /// Caller error: bad payload, bad SQL shape, out-of-range parameter
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced metric, dashboard, or key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent create raced, or an identity is already bound elsewhere
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation is invalid for the metric's type (gauge vs counter)
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Row or byte cap exceeded
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// SQL could not be parsed or validated
    #[error("SQL parse error: {0}")]
    SqlParse(String),

    /// Transient backend failure; safe to retry with backoff
    #[error("backend transient: {0}")]
    BackendTransient(String),

    /// Non-retryable backend failure
    #[error("backend fatal: {0}")]
    BackendFatal(String),
}

impl RingError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, RingError::BackendTransient(_))
    }

    /// Machine-readable kind code for API responses
    pub fn kind_code(&self) -> &'static str {
        match self {
            RingError::Validation(_) | RingError::SqlParse(_) => "VALIDATION",
            RingError::NotFound(_) => "NOT_FOUND",
            RingError::Conflict(_) => "CONFLICT",
            RingError::TypeMismatch(_) => "TYPE_MISMATCH",
            RingError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            RingError::BackendTransient(_) => "BACKEND_TRANSIENT",
            RingError::BackendFatal(_) => "BACKEND_FATAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(RingError::BackendTransient("commit conflict".into()).is_retryable());
        assert!(!RingError::BackendFatal("corrupt record".into()).is_retryable());
        assert!(!RingError::Validation("step must be >= 1".into()).is_retryable());
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(RingError::SqlParse("x".into()).kind_code(), "VALIDATION");
        assert_eq!(RingError::TypeMismatch("x".into()).kind_code(), "TYPE_MISMATCH");
    }
}
