//! Storage error taxonomy.

/// Errors reported by a [`StorageClient`](crate::StorageClient).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("insufficient storage: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("multipart upload no longer exists: {0}")]
    NoSuchUpload(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StorageError {
    /// Classifies an HTTP status code returned by the remote endpoint.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Authentication(message),
            404 => Self::NotFound(message),
            413 | 507 => Self::QuotaExceeded(message),
            408 | 429 | 500..=599 => Self::Server { status, message },
            _ => Self::InvalidRequest(format!("{status}: {message}")),
        }
    }

    /// Returns `true` for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Server { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert!(matches!(
            StorageError::from_status(403, "denied"),
            StorageError::Authentication(_)
        ));
        assert!(matches!(
            StorageError::from_status(404, "gone"),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            StorageError::from_status(507, "full"),
            StorageError::QuotaExceeded(_)
        ));
        assert!(matches!(
            StorageError::from_status(400, "bad"),
            StorageError::InvalidRequest(_)
        ));
    }

    #[test]
    fn gateway_timeouts_are_retryable() {
        assert!(StorageError::from_status(524, "origin timeout").is_retryable());
        assert!(StorageError::from_status(503, "busy").is_retryable());
        assert!(StorageError::from_status(429, "slow down").is_retryable());
        assert!(StorageError::Timeout.is_retryable());
    }

    #[test]
    fn fatal_classes_are_not_retryable() {
        assert!(!StorageError::from_status(507, "full").is_retryable());
        assert!(!StorageError::Authentication("x".into()).is_retryable());
        assert!(!StorageError::NoSuchUpload("u1".into()).is_retryable());
        assert!(!StorageError::NotFound("k".into()).is_retryable());
    }
}
