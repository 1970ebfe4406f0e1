use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};
use volsync_protocol::{StorageClient, StorageError};

use crate::TransferError;
use crate::store::SessionStore;
use crate::types::{Session, TransferKind};

/// Counts from one reaping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Remote multipart sessions aborted (or already gone).
    pub aborted: usize,
    /// Aborts or local deletions that failed.
    pub failed: usize,
    /// Local session records removed.
    pub local_removed: usize,
}

/// Aborts multipart uploads nobody is going to finish.
pub struct Reaper {
    client: Arc<dyn StorageClient>,
    store: Arc<SessionStore>,
}

impl Reaper {
    pub fn new(client: Arc<dyn StorageClient>, store: Arc<SessionStore>) -> Self {
        Self { client, store }
    }

    /// Aborts uploads on `volume_id` started more than `older_than` ago and
    /// prunes the matching local records.
    ///
    /// Sessions held by a running transfer in this process are left alone.
    /// Individual failures are counted; only a failed listing is an error.
    pub async fn reap(
        &self,
        volume_id: &str,
        older_than: Duration,
    ) -> Result<ReapReport, TransferError> {
        let age = TimeDelta::from_std(older_than).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let uploads = self.client.list_in_progress_uploads(volume_id).await?;
        let open: HashSet<&str> = uploads.iter().map(|u| u.session_id.as_str()).collect();

        let local: HashMap<String, Session> = self
            .store
            .list()?
            .into_iter()
            .filter(|s| s.key.kind == TransferKind::Upload && s.key.volume_id == volume_id)
            .map(|s| (s.session_id.clone(), s))
            .collect();

        let mut report = ReapReport::default();
        let mut aborted = HashSet::new();
        for upload in uploads.iter().filter(|u| u.started_at < cutoff) {
            let _guard = match local.get(&upload.session_id) {
                Some(session) => match self.store.try_lock(&session.key) {
                    Some(guard) => Some(guard),
                    None => {
                        debug!(session = %upload.session_id, "upload is active, not reaping");
                        continue;
                    }
                },
                None => None,
            };
            match self.client.abort_multipart(&upload.session_id).await {
                Ok(()) | Err(StorageError::NoSuchUpload(_)) => {
                    debug!(
                        session = %upload.session_id,
                        key = %upload.key,
                        started_at = %upload.started_at,
                        "aborted abandoned upload"
                    );
                    report.aborted += 1;
                    aborted.insert(upload.session_id.clone());
                }
                Err(e) => {
                    warn!(session = %upload.session_id, error = %e, "failed to abort upload");
                    report.failed += 1;
                }
            }
        }

        // Records whose remote session was just aborted, plus stale records
        // whose remote session no longer exists.
        let stale = self.store.list_stale(older_than)?;
        let doomed = local
            .values()
            .filter(|s| aborted.contains(&s.session_id))
            .chain(stale.iter().filter(|s| {
                s.key.kind == TransferKind::Upload
                    && s.key.volume_id == volume_id
                    && !open.contains(s.session_id.as_str())
                    && !aborted.contains(&s.session_id)
            }));
        for session in doomed {
            let Some(_guard) = self.store.try_lock(&session.key) else {
                continue;
            };
            match self.store.delete(&session.key) {
                Ok(true) => report.local_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(session = %session.session_id, error = %e, "failed to remove session record");
                    report.failed += 1;
                }
            }
        }

        info!(
            volume = volume_id,
            aborted = report.aborted,
            failed = report.failed,
            local_removed = report.local_removed,
            "abandoned upload cleanup finished"
        );
        Ok(report)
    }
}
