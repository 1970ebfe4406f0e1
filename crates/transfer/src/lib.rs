//! Chunked multipart transfer with resume support and integrity checks.
//!
//! A transfer is planned into parts ([`plan`]), driven part-by-part through a
//! bounded [`WorkerPool`], and recorded in a durable [`SessionStore`] after
//! every part so an interrupted transfer only redoes what is missing.

mod checksum;
mod chunked;
mod manager;
mod plan;
mod pool;
mod progress;
mod reaper;
mod retry;
mod store;
mod types;
mod validation;

pub use checksum::{digest_file, digest_part, digest_reader};
pub use chunked::{Chunk, PartWriter, partial_path, read_part};
pub use manager::{MultipartManager, TransferReport, TransferRequest};
pub use plan::{
    GIB, MAX_PART_COUNT, MAX_PART_SIZE, MIB, TransferPlan, plan, plan_with, tier_chunk_size,
};
pub use pool::{DownloadPart, PartFailure, PartResult, PartTask, UploadPart, WorkerPool};
pub use progress::{ProgressSink, TransferMeter};
pub use reaper::{ReapReport, Reaper};
pub use retry::{Attempt, RetryPolicy, with_retry};
pub use store::{ResumeLookup, SessionLock, SessionStore, config_dir, default_state_dir};
pub use types::{PartRecord, Session, SessionKey, SessionState, TransferKind};
pub use validation::validate_relative_key;

use volsync_protocol::StorageError;

/// Default number of parts in flight per file.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("integrity check failed for {}: expected {expected}, got {actual}", part_label(.part))]
    Integrity {
        part: Option<u32>,
        expected: String,
        actual: String,
    },

    #[error("part {index} failed: {cause}")]
    PartTransferFailed {
        index: u32,
        #[source]
        cause: Box<TransferError>,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("transfer incomplete: {missing} part(s) missing")]
    Incomplete { missing: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("task join error: {0}")]
    Join(String),
}

fn part_label(part: &Option<u32>) -> String {
    match part {
        Some(index) => format!("part {index}"),
        None => "whole object".to_string(),
    }
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Authentication(msg) => Self::Authentication(msg),
            StorageError::QuotaExceeded(msg) => Self::QuotaExceeded(msg),
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::NoSuchUpload(msg) => Self::SessionExpired(msg),
            other => Self::Storage(other),
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

impl TransferError {
    /// Transient failures that another attempt may cure.
    ///
    /// Integrity mismatches count: the part is re-sent under the same budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            Self::Integrity { .. } => true,
            _ => false,
        }
    }

    /// Failures that make every remaining part of the same object pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::QuotaExceeded(_)
                | Self::NotFound(_)
                | Self::SessionExpired(_)
                | Self::InvalidConfiguration(_)
                | Self::InvalidPath(_)
                | Self::Io(_)
                | Self::Cancelled
        )
    }
}
