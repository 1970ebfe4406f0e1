use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a stored object, as returned by head/list/complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Content digest (SHA-256 hex) when the backend exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Receipt for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartToken {
    /// Zero-based part index.
    pub index: u32,
    pub etag: String,
    /// Digest of the bytes the remote received, if it echoes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectMeta>,
    /// Continuation token for the next page; `None` on the last page.
    pub next: Option<String>,
}

/// A multipart session that was started but never completed or aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InProgressUpload {
    pub session_id: String,
    pub key: String,
    pub started_at: DateTime<Utc>,
}
