use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use volsync_protocol::PartToken;

use crate::TransferError;
use crate::plan::TransferPlan;

/// Direction of a single-object transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "download")]
    Download,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "failed")]
    Failed,
}

/// Identity of a resumable transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub kind: TransferKind,
    pub volume_id: String,
    pub remote_key: String,
    pub local_path: PathBuf,
}

impl SessionKey {
    pub fn new(
        kind: TransferKind,
        volume_id: impl Into<String>,
        remote_key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            volume_id: volume_id.into(),
            remote_key: remote_key.into(),
            local_path: local_path.into(),
        }
    }

    /// Stable file-system-safe name for this key.
    pub fn storage_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.volume_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.remote_key.as_bytes());
        hasher.update([0]);
        hasher.update(self.local_path.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A part that has been transferred and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub index: u32,
    pub digest: String,
    /// Remote ETag for uploads, byte offset for downloads.
    pub token: String,
}

/// Durable state of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub key: SessionKey,
    pub plan: TransferPlan,
    #[serde(with = "parts_as_list")]
    pub completed_parts: BTreeMap<u32, PartRecord>,
    /// Fingerprint of the source the parts were taken from.
    pub source_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whole_object_digest: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Session {
    /// Creates a pending session.
    pub fn new(
        session_id: impl Into<String>,
        key: SessionKey,
        plan: TransferPlan,
        source_digest: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            key,
            plan,
            completed_parts: BTreeMap::new(),
            source_digest: source_digest.into(),
            whole_object_digest: None,
            state: SessionState::Pending,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Marks the session as in-progress.
    pub fn start(&mut self) {
        self.set_state(SessionState::InProgress);
    }

    /// Marks the session as completed.
    pub fn complete(&mut self) {
        self.set_state(SessionState::Completed);
    }

    /// Marks the session as failed.
    pub fn fail(&mut self) {
        self.set_state(SessionState::Failed);
    }

    /// Marks the session as aborted.
    pub fn abort(&mut self) {
        self.set_state(SessionState::Aborted);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.last_updated_at = Utc::now();
    }

    /// Records a completed part, replacing any earlier record for the index.
    pub fn record_part(&mut self, record: PartRecord) -> Result<(), TransferError> {
        if record.index >= self.plan.part_count() {
            return Err(TransferError::InvalidConfiguration(format!(
                "part {} is outside the plan of {} parts",
                record.index,
                self.plan.part_count()
            )));
        }
        self.completed_parts.insert(record.index, record);
        self.last_updated_at = Utc::now();
        Ok(())
    }

    /// Drops a part record whose data no longer verifies.
    pub fn forget_part(&mut self, index: u32) -> Option<PartRecord> {
        let removed = self.completed_parts.remove(&index);
        if removed.is_some() {
            self.last_updated_at = Utc::now();
        }
        removed
    }

    pub fn is_part_done(&self, index: u32) -> bool {
        self.completed_parts.contains_key(&index)
    }

    /// Indices not yet recorded, ascending.
    pub fn missing_parts(&self) -> Vec<u32> {
        self.plan
            .indices()
            .filter(|i| !self.completed_parts.contains_key(i))
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_parts.len()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_parts
            .keys()
            .map(|&i| self.plan.part_len(i))
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_parts.len() as u32 == self.plan.part_count()
    }

    /// Part tokens in index order, as the completion call expects them.
    pub fn part_tokens(&self) -> Vec<PartToken> {
        self.completed_parts
            .values()
            .map(|r| PartToken {
                index: r.index,
                etag: r.token.clone(),
                digest: Some(r.digest.clone()),
            })
            .collect()
    }

    /// Whether this session may be continued for a source with `digest`.
    pub fn is_resumable_with(&self, digest: &str) -> bool {
        self.state == SessionState::InProgress && self.source_digest == digest
    }
}

/// Serialises the completed-part map as an index-sorted list.
mod parts_as_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::PartRecord;

    pub fn serialize<S: Serializer>(
        parts: &BTreeMap<u32, PartRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(parts.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u32, PartRecord>, D::Error> {
        let list = Vec::<PartRecord>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|r| (r.index, r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan_with;

    fn sample_session() -> Session {
        let key = SessionKey::new(TransferKind::Upload, "vol-1", "a/b.bin", "/tmp/b.bin");
        let mut s = Session::new("mp-1", key, plan_with(100, Some(30)).unwrap(), "abc");
        s.start();
        s
    }

    fn record(index: u32) -> PartRecord {
        PartRecord {
            index,
            digest: format!("d{index}"),
            token: format!("e{index}"),
        }
    }

    #[test]
    fn new_session_is_pending() {
        let key = SessionKey::new(TransferKind::Download, "v", "k", "/l");
        let s = Session::new("id", key, plan_with(10, Some(5)).unwrap(), "x");
        assert_eq!(s.state, SessionState::Pending);
        assert!(!s.is_resumable_with("x"));
        assert_eq!(s.missing_parts(), vec![0, 1]);
    }

    #[test]
    fn record_part_tracks_bytes_and_missing() {
        let mut s = sample_session();
        s.record_part(record(2)).unwrap();
        s.record_part(record(0)).unwrap();
        s.record_part(record(2)).unwrap();
        assert_eq!(s.completed_count(), 2);
        assert_eq!(s.completed_bytes(), 30 + 30);
        assert_eq!(s.missing_parts(), vec![1, 3]);
        assert!(!s.is_complete());

        s.record_part(record(1)).unwrap();
        s.record_part(record(3)).unwrap();
        assert!(s.is_complete());
        assert_eq!(s.completed_bytes(), 100);
    }

    #[test]
    fn record_part_rejects_out_of_range() {
        let mut s = sample_session();
        assert!(matches!(
            s.record_part(record(4)),
            Err(TransferError::InvalidConfiguration(_))
        ));
        assert_eq!(s.completed_count(), 0);
    }

    #[test]
    fn part_tokens_are_index_ordered() {
        let mut s = sample_session();
        for i in [3, 1, 0, 2] {
            s.record_part(record(i)).unwrap();
        }
        let indices: Vec<_> = s.part_tokens().iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(s.part_tokens()[1].etag, "e1");
    }

    #[test]
    fn resumable_requires_in_progress_and_same_digest() {
        let mut s = sample_session();
        assert!(s.is_resumable_with("abc"));
        assert!(!s.is_resumable_with("abd"));
        s.fail();
        assert!(!s.is_resumable_with("abc"));
    }

    #[test]
    fn forget_part_reopens_index() {
        let mut s = sample_session();
        s.record_part(record(1)).unwrap();
        assert!(s.forget_part(1).is_some());
        assert!(s.forget_part(1).is_none());
        assert!(!s.is_part_done(1));
    }

    #[test]
    fn storage_name_separates_kinds() {
        let up = SessionKey::new(TransferKind::Upload, "v", "k", "/l");
        let down = SessionKey::new(TransferKind::Download, "v", "k", "/l");
        assert_ne!(up.storage_name(), down.storage_name());
        assert_eq!(up.storage_name(), up.clone().storage_name());
        assert_eq!(up.storage_name().len(), 64);
    }

    #[test]
    fn session_json_roundtrip() {
        let mut s = sample_session();
        s.record_part(record(1)).unwrap();
        s.record_part(record(0)).unwrap();
        s.whole_object_digest = Some("ff".into());

        let json = serde_json::to_string_pretty(&s).unwrap();
        assert!(json.contains("\"state\": \"in_progress\""));
        assert!(json.contains("\"completedParts\""));
        assert!(json.contains("\"kind\": \"upload\""));

        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
