use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of a sync is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Local tree to remote prefix.
    Push,
    /// Remote prefix to local tree.
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Download,
    /// Remove the orphan on the destination side.
    Delete,
    Skip,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
            Self::Skip => "skip",
        }
    }
}

/// One side's view of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub size: u64,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A planned operation for one relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub relative_path: String,
    pub remote_key: String,
    pub local: Option<FileState>,
    pub remote: Option<FileState>,
    pub action: SyncAction,
    pub reason: String,
}

/// The full set of operations for one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub direction: SyncDirection,
    pub volume_id: String,
    pub local_root: PathBuf,
    /// Normalized prefix: empty or ending in `/`.
    pub remote_prefix: String,
    pub entries: Vec<SyncEntry>,
}

impl SyncPlan {
    pub fn count(&self, action: SyncAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Entries that will actually touch data.
    pub fn pending(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.iter().filter(|e| e.action != SyncAction::Skip)
    }

    pub fn is_noop(&self) -> bool {
        self.pending().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Succeeded(SyncAction),
    Skipped(String),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub relative_path: String,
    pub outcome: EntryOutcome,
}

/// Outcome of executing a [`SyncPlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub entries: Vec<EntryReport>,
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SyncReport {
    pub fn record(&mut self, relative_path: impl Into<String>, outcome: EntryOutcome) {
        match &outcome {
            EntryOutcome::Succeeded(SyncAction::Upload) => self.uploaded += 1,
            EntryOutcome::Succeeded(SyncAction::Download) => self.downloaded += 1,
            EntryOutcome::Succeeded(SyncAction::Delete) => self.deleted += 1,
            EntryOutcome::Succeeded(SyncAction::Skip) | EntryOutcome::Skipped(_) => {
                self.skipped += 1
            }
            EntryOutcome::Failed(_) => self.failed += 1,
            EntryOutcome::Cancelled => self.cancelled += 1,
        }
        self.entries.push(EntryReport {
            relative_path: relative_path.into(),
            outcome,
        });
    }

    /// True when nothing failed and nothing was cancelled.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    pub fn outcome_of(&self, relative_path: &str) -> Option<&EntryOutcome> {
        self.entries
            .iter()
            .find(|e| e.relative_path == relative_path)
            .map(|e| &e.outcome)
    }

    /// Sorts entries by relative path; execution finishes them out of order.
    pub(crate) fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    }
}
