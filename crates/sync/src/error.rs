//! Sync error types.

use volsync_protocol::StorageError;
use volsync_transfer::TransferError;

/// Errors produced while planning or running directory syncs.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        Self::Transfer(err.into())
    }
}

impl SyncError {
    /// Whether the failure came from an expired remote session.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::Transfer(TransferError::SessionExpired(_)))
    }
}
