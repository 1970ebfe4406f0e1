//! Directory sync and the caller-facing engine.
//!
//! [`Reconciler`] compares a local tree with a remote prefix and produces a
//! [`SyncPlan`]; executing the plan drives per-file transfers through the
//! shared [`MultipartManager`](volsync_transfer::MultipartManager).
//! [`Engine`] wraps both behind the operations callers use.

pub mod config;
mod engine;
pub mod error;
mod exclude;
pub mod logging;
mod reconciler;
mod scanner;
mod types;

pub use config::{EngineConfig, TransferOptions, config_path};
pub use engine::Engine;
pub use error::SyncError;
pub use exclude::ExcludeSet;
pub use reconciler::{Reconciler, SyncRequest};
pub use scanner::{LocalFile, scan_local};
pub use types::{
    EntryOutcome, EntryReport, FileState, SyncAction, SyncDirection, SyncEntry, SyncPlan,
    SyncReport,
};

/// Default number of files transferred at once during a directory pass.
pub const DEFAULT_FILE_CONCURRENCY: usize = 4;
