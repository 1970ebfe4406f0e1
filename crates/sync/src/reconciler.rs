//! Directory reconciliation between a local tree and a remote prefix.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use volsync_protocol::{ObjectMeta, StorageClient};
use volsync_transfer::{
    MultipartManager, TransferError, TransferKind, TransferReport, TransferRequest, digest_file,
    validate_relative_key, with_retry,
};

use crate::config::TransferOptions;
use crate::error::SyncError;
use crate::exclude::ExcludeSet;
use crate::scanner::{LocalFile, scan_local};
use crate::types::{
    EntryOutcome, FileState, SyncAction, SyncDirection, SyncEntry, SyncPlan, SyncReport,
};

/// What to reconcile.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub local_root: PathBuf,
    pub volume_id: String,
    pub remote_prefix: String,
    pub exclude_patterns: Vec<String>,
    /// Remove destination files that no longer exist at the source.
    pub delete_orphans: bool,
    pub direction: SyncDirection,
}

impl SyncRequest {
    pub fn new(
        local_root: impl Into<PathBuf>,
        volume_id: impl Into<String>,
        remote_prefix: impl Into<String>,
        direction: SyncDirection,
    ) -> Self {
        Self {
            local_root: local_root.into(),
            volume_id: volume_id.into(),
            remote_prefix: remote_prefix.into(),
            exclude_patterns: Vec::new(),
            delete_orphans: false,
            direction,
        }
    }

    pub fn with_excludes(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    pub fn with_delete_orphans(mut self, delete_orphans: bool) -> Self {
        self.delete_orphans = delete_orphans;
        self
    }
}

/// Plans and executes directory syncs.
pub struct Reconciler {
    client: Arc<dyn StorageClient>,
    manager: Arc<MultipartManager>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn StorageClient>, manager: Arc<MultipartManager>) -> Self {
        Self { client, manager }
    }

    /// Compares both sides and decides an action for every path.
    pub async fn plan(&self, request: &SyncRequest) -> Result<SyncPlan, SyncError> {
        let excludes = ExcludeSet::new(&request.exclude_patterns)?;
        let prefix = normalize_prefix(&request.remote_prefix);

        let local = self.scan(request, &excludes).await?;
        let remote = self.list_remote(&request.volume_id, &prefix).await?;

        let mut paths: BTreeMap<String, (Option<LocalFile>, Option<ObjectMeta>)> = BTreeMap::new();
        for file in local {
            let key = file.relative_path.clone();
            paths.entry(key).or_default().0 = Some(file);
        }

        let mut entries = Vec::new();
        for object in remote {
            let Some(rel) = object.key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rel.is_empty() || rel.ends_with('/') {
                continue;
            }
            if let Err(e) = validate_relative_key(rel) {
                warn!(key = %object.key, error = %e, "skipping remote key outside the sync root");
                entries.push(SyncEntry {
                    relative_path: rel.to_string(),
                    remote_key: object.key.clone(),
                    local: None,
                    remote: Some(remote_state(&object)),
                    action: SyncAction::Skip,
                    reason: format!("unsafe path: {e}"),
                });
                continue;
            }
            if excludes.is_excluded(rel) {
                continue;
            }
            let key = rel.to_string();
            paths.entry(key).or_default().1 = Some(object);
        }

        for (rel, (local, remote)) in paths {
            let remote_key = format!("{prefix}{rel}");
            entries.push(self.decide(request, rel, remote_key, local, remote).await?);
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let plan = SyncPlan {
            direction: request.direction,
            volume_id: request.volume_id.clone(),
            local_root: request.local_root.clone(),
            remote_prefix: prefix,
            entries,
        };
        info!(
            volume = %plan.volume_id,
            prefix = %plan.remote_prefix,
            direction = ?plan.direction,
            uploads = plan.count(SyncAction::Upload),
            downloads = plan.count(SyncAction::Download),
            deletes = plan.count(SyncAction::Delete),
            skips = plan.count(SyncAction::Skip),
            "sync planned"
        );
        Ok(plan)
    }

    /// Runs every non-skip entry of `plan`, at most `file_concurrency` at once.
    ///
    /// Failures are recorded per entry and never stop the rest. Once
    /// `options.cancel` fires, entries that have not started are reported
    /// as cancelled.
    pub async fn execute(
        &self,
        plan: &SyncPlan,
        options: &TransferOptions,
    ) -> Result<SyncReport, SyncError> {
        if options.file_concurrency == 0 {
            return Err(SyncError::InvalidConfiguration(
                "fileConcurrency must be at least 1".into(),
            ));
        }

        let total = plan.entries.len() as u64;
        let mut done = 0u64;
        let mut report = SyncReport::default();
        let progress = |done: u64, rel: &str| {
            if let Some(sink) = &options.progress {
                sink.on_progress(done, total, rel);
            }
        };

        for entry in plan.entries.iter().filter(|e| e.action == SyncAction::Skip) {
            report.record(&entry.relative_path, EntryOutcome::Skipped(entry.reason.clone()));
            done += 1;
            progress(done, &entry.relative_path);
        }

        let runner = Arc::new(EntryRunner {
            client: Arc::clone(&self.client),
            manager: Arc::clone(&self.manager),
            volume_id: plan.volume_id.clone(),
            local_root: plan.local_root.clone(),
            direction: plan.direction,
            options: options.clone(),
        });
        let permits = Arc::new(Semaphore::new(options.file_concurrency));
        let mut running = FuturesUnordered::new();

        for entry in plan.pending() {
            let entry = entry.clone();
            let rel = entry.relative_path.clone();
            let runner = Arc::clone(&runner);
            let permits = Arc::clone(&permits);
            let cancel = options.cancel.child_token();
            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return EntryOutcome::Cancelled,
                    permit = permits.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return EntryOutcome::Cancelled;
                };
                if cancel.is_cancelled() {
                    return EntryOutcome::Cancelled;
                }
                runner.run(&entry, cancel).await
            });
            running.push(async move { (rel, handle.await) });
        }

        while let Some((rel, joined)) = running.next().await {
            let outcome = joined.unwrap_or_else(|e| EntryOutcome::Failed(format!("task failed: {e}")));
            if let EntryOutcome::Failed(msg) = &outcome {
                error!(path = %rel, error = %msg, "sync entry failed");
            }
            report.record(&rel, outcome);
            done += 1;
            progress(done, &rel);
        }
        report.sort();

        info!(
            volume = %plan.volume_id,
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            deleted = report.deleted,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "sync finished"
        );
        Ok(report)
    }

    async fn scan(
        &self,
        request: &SyncRequest,
        excludes: &ExcludeSet,
    ) -> Result<Vec<LocalFile>, SyncError> {
        let root = request.local_root.clone();
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SyncError::InvalidPath(format!(
                    "not a directory: {}",
                    root.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return match request.direction {
                    SyncDirection::Pull => Ok(Vec::new()),
                    SyncDirection::Push => Err(SyncError::InvalidPath(format!(
                        "local root does not exist: {}",
                        root.display()
                    ))),
                };
            }
            Err(e) => return Err(e.into()),
        }
        let excludes = excludes.clone();
        tokio::task::spawn_blocking(move || scan_local(&root, &excludes))
            .await
            .map_err(TransferError::from)?
    }

    async fn list_remote(&self, volume_id: &str, prefix: &str) -> Result<Vec<ObjectMeta>, SyncError> {
        let retry = self.manager.retry_policy();
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = with_retry(retry, "list objects", |_| async {
                self.client
                    .list_objects(volume_id, prefix, continuation.as_deref())
                    .await
                    .map_err(TransferError::from)
            })
            .await?;
            objects.extend(page.entries);
            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        debug!(volume = volume_id, prefix, count = objects.len(), "listed remote prefix");
        Ok(objects)
    }

    async fn decide(
        &self,
        request: &SyncRequest,
        relative_path: String,
        remote_key: String,
        local: Option<LocalFile>,
        remote: Option<ObjectMeta>,
    ) -> Result<SyncEntry, SyncError> {
        let mut local_state = local.as_ref().map(|f| FileState {
            size: f.size,
            modified: f.modified,
            digest: None,
        });
        let remote_state = remote.as_ref().map(remote_state);

        let (action, reason) = match (&local, &remote, request.direction) {
            (Some(file), Some(object), direction) => {
                let (same, local_digest) = unchanged(file, object, direction).await?;
                if let Some(state) = local_state.as_mut() {
                    state.digest = local_digest;
                }
                match (same, direction) {
                    (true, _) => (SyncAction::Skip, "unchanged"),
                    (false, SyncDirection::Push) => (SyncAction::Upload, "changed"),
                    (false, SyncDirection::Pull) => (SyncAction::Download, "changed"),
                }
            }
            (Some(_), None, SyncDirection::Push) => (SyncAction::Upload, "new"),
            (None, Some(_), SyncDirection::Pull) => (SyncAction::Download, "new"),
            (None, Some(_), SyncDirection::Push) | (Some(_), None, SyncDirection::Pull) => {
                if request.delete_orphans {
                    (SyncAction::Delete, "orphan")
                } else {
                    (SyncAction::Skip, "orphan kept")
                }
            }
            (None, None, _) => (SyncAction::Skip, "missing on both sides"),
        };

        Ok(SyncEntry {
            relative_path,
            remote_key,
            local: local_state,
            remote: remote_state,
            action,
            reason: reason.to_string(),
        })
    }
}

/// Whether the destination already matches the source.
///
/// Compares content digests when the remote exposes one; otherwise equal
/// sizes and a destination at least as new as the source count as a match.
/// Returns the local digest when one was computed.
async fn unchanged(
    local: &LocalFile,
    remote: &ObjectMeta,
    direction: SyncDirection,
) -> Result<(bool, Option<String>), SyncError> {
    if local.size != remote.size {
        return Ok((false, None));
    }
    if let Some(remote_digest) = &remote.digest {
        let path = local.path.clone();
        let digest = tokio::task::spawn_blocking(move || digest_file(&path))
            .await
            .map_err(TransferError::from)??;
        let same = digest.eq_ignore_ascii_case(remote_digest);
        return Ok((same, Some(digest)));
    }
    let fresh = match direction {
        SyncDirection::Push => remote.modified >= local.modified,
        SyncDirection::Pull => local.modified >= remote.modified,
    };
    Ok((fresh, None))
}

fn remote_state(object: &ObjectMeta) -> FileState {
    FileState {
        size: object.size,
        modified: object.modified,
        digest: object.digest.clone(),
    }
}

/// Strips leading slashes and makes a non-empty prefix end in `/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Shared state for the per-entry tasks of one execution.
struct EntryRunner {
    client: Arc<dyn StorageClient>,
    manager: Arc<MultipartManager>,
    volume_id: String,
    local_root: PathBuf,
    direction: SyncDirection,
    options: TransferOptions,
}

impl EntryRunner {
    async fn run(&self, entry: &SyncEntry, cancel: CancellationToken) -> EntryOutcome {
        let result = match (entry.action, self.direction) {
            (SyncAction::Upload, _) => self.upload(entry, cancel).await,
            (SyncAction::Download, _) => self.download(entry, cancel).await,
            (SyncAction::Delete, SyncDirection::Push) => self.delete_remote(entry).await,
            (SyncAction::Delete, SyncDirection::Pull) => self.delete_local(entry).await,
            (SyncAction::Skip, _) => return EntryOutcome::Skipped(entry.reason.clone()),
        };
        match result {
            Ok(()) => EntryOutcome::Succeeded(entry.action),
            Err(SyncError::Cancelled | SyncError::Transfer(TransferError::Cancelled)) => {
                EntryOutcome::Cancelled
            }
            Err(e) => EntryOutcome::Failed(e.to_string()),
        }
    }

    fn local_path(&self, entry: &SyncEntry) -> PathBuf {
        entry
            .relative_path
            .split('/')
            .fold(self.local_root.clone(), |path, segment| path.join(segment))
    }

    fn request(&self, entry: &SyncEntry, cancel: CancellationToken) -> TransferRequest {
        TransferRequest::new(self.local_path(entry), &self.volume_id, &entry.remote_key)
            .with_chunk_size(self.options.chunk_size)
            .with_concurrency(self.options.concurrency)
            .with_resume(self.options.enable_resume)
            .with_size_mtime_resume(self.options.allow_size_mtime_resume)
            .with_cancel(cancel)
    }

    async fn upload(&self, entry: &SyncEntry, cancel: CancellationToken) -> Result<(), SyncError> {
        let request = self.request(entry, cancel);
        run_transfer(
            &self.manager,
            TransferKind::Upload,
            request,
            self.options.restart_on_expired,
        )
        .await?;
        Ok(())
    }

    async fn download(&self, entry: &SyncEntry, cancel: CancellationToken) -> Result<(), SyncError> {
        let request = self.request(entry, cancel);
        if let Some(parent) = request.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        run_transfer(
            &self.manager,
            TransferKind::Download,
            request,
            self.options.restart_on_expired,
        )
        .await?;
        Ok(())
    }

    async fn delete_remote(&self, entry: &SyncEntry) -> Result<(), SyncError> {
        let result = with_retry(self.manager.retry_policy(), "delete object", |_| async {
            self.client
                .delete_object(&self.volume_id, &entry.remote_key)
                .await
                .map_err(TransferError::from)
        })
        .await;
        match result {
            Ok(()) | Err(TransferError::NotFound(_)) => {
                debug!(key = %entry.remote_key, "deleted remote orphan");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_local(&self, entry: &SyncEntry) -> Result<(), SyncError> {
        let path = self.local_path(entry);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "deleted local orphan");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs one transfer, starting over once if the remote session expired.
///
/// The manager drops the record of an expired session, so the second
/// attempt begins from scratch.
pub(crate) async fn run_transfer(
    manager: &MultipartManager,
    kind: TransferKind,
    request: TransferRequest,
    restart_on_expired: bool,
) -> Result<TransferReport, TransferError> {
    let first = match kind {
        TransferKind::Upload => manager.upload(request.clone()).await,
        TransferKind::Download => manager.download(request.clone()).await,
    };
    match first {
        Err(TransferError::SessionExpired(msg)) if restart_on_expired => {
            warn!(
                key = %request.remote_key,
                kind = kind.as_str(),
                error = %msg,
                "remote session expired, restarting transfer"
            );
            match kind {
                TransferKind::Upload => manager.upload(request).await,
                TransferKind::Download => manager.download(request).await,
            }
        }
        other => other,
    }
}
