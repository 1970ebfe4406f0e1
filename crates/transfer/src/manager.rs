//! Single-object multipart transfers with durable resume.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use volsync_protocol::{ObjectMeta, StorageClient, StorageError};

use crate::checksum::{digest_file, digest_part, verify};
use crate::chunked::{PartWriter, partial_path};
use crate::plan::{GIB, TransferPlan, plan_with};
use crate::pool::{DownloadPart, PartFailure, PartTask, UploadPart, WorkerPool};
use crate::progress::{ProgressSink, TransferMeter};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::{ResumeLookup, SessionStore};
use crate::types::{Session, SessionKey, TransferKind};
use crate::{DEFAULT_CONCURRENCY, TransferError};

const MIN_COMPLETE_TIMEOUT: Duration = Duration::from_secs(60);
const COMPLETE_TIMEOUT_PER_GIB: Duration = Duration::from_secs(5);

/// Parameters of one file transfer.
#[derive(Clone)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    pub volume_id: String,
    pub remote_key: String,
    /// Overrides the tiered chunk size.
    pub chunk_size: Option<u64>,
    /// Parts in flight at once.
    pub concurrency: usize,
    pub enable_resume: bool,
    /// Lets a download resume against an object without a remote digest
    /// when its size and modification time are unchanged. Off by default.
    pub allow_size_mtime_resume: bool,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancellationToken,
}

impl TransferRequest {
    pub fn new(
        local_path: impl Into<PathBuf>,
        volume_id: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            volume_id: volume_id.into(),
            remote_key: remote_key.into(),
            chunk_size: None,
            concurrency: DEFAULT_CONCURRENCY,
            enable_resume: true,
            allow_size_mtime_resume: false,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<u64>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_resume(mut self, enable_resume: bool) -> Self {
        self.enable_resume = enable_resume;
        self
    }

    pub fn with_size_mtime_resume(mut self, allow: bool) -> Self {
        self.allow_size_mtime_resume = allow;
        self
    }

    pub fn with_progress(mut self, progress: Option<Arc<dyn ProgressSink>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn key(&self, kind: TransferKind) -> SessionKey {
        SessionKey::new(
            kind,
            self.volume_id.clone(),
            self.remote_key.clone(),
            self.local_path.clone(),
        )
    }

    fn report_progress(&self, done: u64, total: u64) {
        if let Some(sink) = &self.progress {
            sink.on_progress(done, total, &self.remote_key);
        }
    }
}

/// Summary of a finished transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub session_id: String,
    pub kind: TransferKind,
    pub remote_key: String,
    /// Metadata of the remote object after the transfer.
    pub object: ObjectMeta,
    pub parts_transferred: u32,
    pub parts_resumed: u32,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

/// Drives uploads and downloads of single objects part by part.
pub struct MultipartManager {
    client: Arc<dyn StorageClient>,
    store: Arc<SessionStore>,
    retry: RetryPolicy,
}

impl MultipartManager {
    pub fn new(client: Arc<dyn StorageClient>, store: Arc<SessionStore>, retry: RetryPolicy) -> Self {
        Self {
            client,
            store,
            retry,
        }
    }

    pub fn client(&self) -> &Arc<dyn StorageClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Uploads `request.local_path` to `request.remote_key`.
    pub async fn upload(&self, request: TransferRequest) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        check_concurrency(request.concurrency)?;

        let meta = tokio::fs::metadata(&request.local_path).await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidPath(format!(
                "not a regular file: {}",
                request.local_path.display()
            )));
        }
        let plan = plan_with(meta.len(), request.chunk_size)?;
        let path = request.local_path.clone();
        let source_digest = tokio::task::spawn_blocking(move || digest_file(&path)).await??;

        let key = request.key(TransferKind::Upload);
        let _guard = self.store.lock(&key).await;
        if request.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut session = self
            .open_upload(&key, plan, &source_digest, request.enable_resume)
            .await?;
        let parts_resumed = session.completed_count() as u32;
        info!(
            key = %request.remote_key,
            session = %session.session_id,
            size = plan.object_size(),
            parts = plan.part_count(),
            resumed = parts_resumed,
            "upload started"
        );

        let tasks: Vec<UploadPart> = session
            .missing_parts()
            .into_iter()
            .map(|index| {
                UploadPart::new(
                    Arc::clone(&self.client),
                    session.session_id.clone(),
                    request.local_path.clone(),
                    plan,
                    index,
                )
            })
            .collect();

        let meter = TransferMeter::default();
        let parts_transferred = match self.run_parts(&mut session, tasks, &request, &meter).await {
            Ok(n) => n,
            Err(_) if request.cancel.is_cancelled() => {
                self.abort_remote(&session).await;
                self.store.delete(&key)?;
                session.abort();
                info!(key = %request.remote_key, session = %session.session_id, "upload cancelled");
                return Err(TransferError::Cancelled);
            }
            Err(e) => return Err(self.fail(&mut session, e)),
        };

        let object = match self.complete_upload(&session).await {
            Ok(object) => object,
            Err(e) => {
                if matches!(e, TransferError::SessionExpired(_)) {
                    self.abort_remote(&session).await;
                }
                return Err(self.fail(&mut session, e));
            }
        };

        if object.size != plan.object_size() {
            self.store.delete(&key)?;
            return Err(TransferError::Integrity {
                part: None,
                expected: format!("{} bytes", plan.object_size()),
                actual: format!("{} bytes", object.size),
            });
        }
        if let Some(remote_digest) = &object.digest
            && let Err(e) = verify(None, &source_digest, remote_digest)
        {
            self.store.delete(&key)?;
            return Err(e);
        }

        session.whole_object_digest = Some(source_digest);
        session.complete();
        self.store.delete(&key)?;

        let report = TransferReport {
            session_id: session.session_id.clone(),
            kind: TransferKind::Upload,
            remote_key: request.remote_key.clone(),
            object,
            parts_transferred,
            parts_resumed,
            bytes_transferred: meter.total_bytes(),
            elapsed: started.elapsed(),
        };
        log_finished(&report, &meter);
        Ok(report)
    }

    /// Downloads `request.remote_key` into `request.local_path`.
    ///
    /// Parts land in a `.volsync-part` staging file that is renamed into
    /// place only after the whole file verifies.
    pub async fn download(&self, request: TransferRequest) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        check_concurrency(request.concurrency)?;

        let object = with_retry(&self.retry, "head object", |_| async {
            self.client
                .head_object(&request.volume_id, &request.remote_key)
                .await
                .map_err(TransferError::from)
        })
        .await?;
        let plan = plan_with(object.size, request.chunk_size)?;
        let fingerprint = remote_fingerprint(&object);

        let key = request.key(TransferKind::Download);
        let _guard = self.store.lock(&key).await;
        if request.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        // Size and mtime alone cannot tell a rewritten object from the
        // original, so they only gate resume when the caller opts in.
        let resume = request.enable_resume
            && (object.digest.is_some() || request.allow_size_mtime_resume);
        if request.enable_resume && !resume {
            debug!(key = %request.remote_key, "remote exposes no digest, not resuming download");
        }

        let staging = partial_path(&request.local_path);
        let (mut session, writer) = self
            .open_download(&key, plan, &fingerprint, &object, &staging, resume)
            .await?;
        let parts_resumed = session.completed_count() as u32;
        info!(
            key = %request.remote_key,
            session = %session.session_id,
            size = plan.object_size(),
            parts = plan.part_count(),
            resumed = parts_resumed,
            "download started"
        );

        let tasks: Vec<DownloadPart> = session
            .missing_parts()
            .into_iter()
            .map(|index| {
                DownloadPart::new(
                    Arc::clone(&self.client),
                    request.volume_id.clone(),
                    request.remote_key.clone(),
                    writer.clone(),
                    plan,
                    index,
                )
            })
            .collect();

        let meter = TransferMeter::default();
        let parts_transferred = match self.run_parts(&mut session, tasks, &request, &meter).await {
            Ok(n) => n,
            Err(_) if request.cancel.is_cancelled() => {
                discard_staging(writer).await;
                self.store.delete(&key)?;
                session.abort();
                info!(key = %request.remote_key, session = %session.session_id, "download cancelled");
                return Err(TransferError::Cancelled);
            }
            Err(e) => return Err(self.fail(&mut session, e)),
        };

        let staged = writer.path().to_path_buf();
        let actual = tokio::task::spawn_blocking(move || digest_file(&staged)).await??;
        let on_disk = tokio::fs::metadata(writer.path()).await?.len();
        let mismatch = if on_disk != object.size {
            Some(TransferError::Integrity {
                part: None,
                expected: format!("{} bytes", object.size),
                actual: format!("{on_disk} bytes"),
            })
        } else {
            object
                .digest
                .as_deref()
                .and_then(|expected| verify(None, expected, &actual).err())
        };
        if let Some(e) = mismatch {
            error!(key = %request.remote_key, error = %e, "downloaded file failed verification");
            discard_staging(writer).await;
            self.store.delete(&key)?;
            return Err(e);
        }

        let dest = request.local_path.clone();
        tokio::task::spawn_blocking(move || writer.finish(&dest)).await??;
        session.whole_object_digest = Some(actual);
        session.complete();
        self.store.delete(&key)?;

        let report = TransferReport {
            session_id: session.session_id.clone(),
            kind: TransferKind::Download,
            remote_key: request.remote_key.clone(),
            object,
            parts_transferred,
            parts_resumed,
            bytes_transferred: meter.total_bytes(),
            elapsed: started.elapsed(),
        };
        log_finished(&report, &meter);
        Ok(report)
    }

    /// Returns a resumable upload session for `key`, or starts a new one.
    async fn open_upload(
        &self,
        key: &SessionKey,
        plan: TransferPlan,
        source_digest: &str,
        enable_resume: bool,
    ) -> Result<Session, TransferError> {
        if enable_resume {
            match self.store.load_resumable(key, source_digest)? {
                ResumeLookup::Resume(session) if session.plan == plan => {
                    debug!(
                        session = %session.session_id,
                        done = session.completed_count(),
                        "resuming upload session"
                    );
                    return Ok(session);
                }
                ResumeLookup::Resume(session) => {
                    debug!(session = %session.session_id, "chunk layout changed, restarting upload");
                    self.store.delete(key)?;
                    self.abort_remote(&session).await;
                }
                ResumeLookup::Discarded(session) => self.abort_remote(&session).await,
                ResumeLookup::Missing => {}
            }
        } else {
            let previous = self.store.load(key).unwrap_or_else(|e| {
                warn!(key = %key.remote_key, error = %e, "ignoring unreadable session record");
                None
            });
            self.store.delete(key)?;
            if let Some(session) = previous {
                self.abort_remote(&session).await;
            }
        }

        let session_id = with_retry(&self.retry, "initiate multipart", |_| async {
            self.client
                .initiate_multipart(&key.volume_id, &key.remote_key)
                .await
                .map_err(TransferError::from)
        })
        .await?;
        let mut session = Session::new(session_id, key.clone(), plan, source_digest);
        session.start();
        self.store.save(&session)?;
        Ok(session)
    }

    /// Returns a resumable download session and its staging file, or starts
    /// a new one.
    async fn open_download(
        &self,
        key: &SessionKey,
        plan: TransferPlan,
        fingerprint: &str,
        object: &ObjectMeta,
        staging: &std::path::Path,
        enable_resume: bool,
    ) -> Result<(Session, PartWriter), TransferError> {
        if enable_resume {
            match self.store.load_resumable(key, fingerprint)? {
                ResumeLookup::Resume(mut session) if session.plan == plan => {
                    if let Some(writer) = PartWriter::open(staging, plan.object_size())? {
                        let dropped = reverify_parts(&mut session, &writer).await?;
                        if dropped > 0 {
                            warn!(
                                key = %key.remote_key,
                                dropped,
                                "staged parts no longer match, fetching them again"
                            );
                            self.store.save(&session)?;
                        }
                        debug!(
                            session = %session.session_id,
                            done = session.completed_count(),
                            "resuming download session"
                        );
                        return Ok((session, writer));
                    }
                    debug!(key = %key.remote_key, "staging file missing, restarting download");
                    self.store.delete(key)?;
                }
                ResumeLookup::Resume(_) => {
                    self.store.delete(key)?;
                }
                ResumeLookup::Discarded(_) | ResumeLookup::Missing => {}
            }
        } else {
            self.store.delete(key)?;
        }

        let path = staging.to_path_buf();
        let size = plan.object_size();
        let writer = tokio::task::spawn_blocking(move || PartWriter::create(&path, size)).await??;
        let mut session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            key.clone(),
            plan,
            fingerprint,
        );
        session.whole_object_digest = object.digest.clone();
        session.start();
        self.store.save(&session)?;
        Ok((session, writer))
    }

    /// Runs `tasks` through a worker pool, recording and persisting every
    /// finished part. Returns the number of parts transferred.
    ///
    /// A fatal part error stops new parts from starting; other failures let
    /// the remaining parts finish. Fatal errors are reported in preference
    /// to the first non-fatal one.
    async fn run_parts<T: PartTask>(
        &self,
        session: &mut Session,
        tasks: Vec<T>,
        request: &TransferRequest,
        meter: &TransferMeter,
    ) -> Result<u32, TransferError> {
        let pool = WorkerPool::new(request.concurrency, self.retry.clone())?;
        let cancel = request.cancel.child_token();
        let total = session.plan.object_size();
        let mut done = session.completed_bytes();
        request.report_progress(done, total);

        let mut pending: FuturesUnordered<_> = tasks
            .into_iter()
            .map(|task| pool.submit(task, cancel.clone()))
            .collect();

        let mut transferred = 0;
        let mut failure: Option<TransferError> = None;
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(Ok(record)) => {
                    let index = record.index;
                    let len = session.plan.part_len(index);
                    let saved = session
                        .record_part(record)
                        .and_then(|()| self.store.save(session));
                    if let Err(e) = saved {
                        cancel.cancel();
                        keep_failure(&mut failure, e);
                        continue;
                    }
                    transferred += 1;
                    done += len;
                    meter.add_sample(len);
                    debug!(
                        key = %request.remote_key,
                        part = index,
                        done = session.completed_count(),
                        total = session.plan.part_count(),
                        bytes_per_sec = meter.bytes_per_second() as u64,
                        eta_secs = meter.eta(total - done).map(|eta| eta.as_secs()),
                        "part complete"
                    );
                    request.report_progress(done, total);
                }
                Ok(Err(PartFailure::NotStarted(_))) => {}
                Ok(Err(PartFailure::Failed { index, error })) => {
                    if error.is_fatal() {
                        cancel.cancel();
                    }
                    warn!(key = %request.remote_key, part = index, error = %error, "part failed");
                    keep_failure(&mut failure, error);
                }
                Err(join) => {
                    cancel.cancel();
                    keep_failure(&mut failure, join.into());
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if !session.is_complete() {
            if request.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            return Err(TransferError::Incomplete {
                missing: session.missing_parts().len(),
            });
        }
        Ok(transferred)
    }

    /// Completes the multipart session, checking after each failed attempt
    /// whether the object was assembled anyway.
    async fn complete_upload(&self, session: &Session) -> Result<ObjectMeta, TransferError> {
        let tokens = session.part_tokens();
        let base_timeout = completion_timeout(session.plan.object_size());
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let timeout = base_timeout.saturating_mul(1 << (attempt - 1).min(16));
            debug!(
                session = %session.session_id,
                attempt,
                timeout_secs = timeout.as_secs(),
                "completing multipart upload"
            );
            let result = match tokio::time::timeout(
                timeout,
                self.client.complete_multipart(&session.session_id, &tokens),
            )
            .await
            {
                Ok(result) => result.map_err(TransferError::from),
                Err(_) => Err(TransferError::Storage(StorageError::Timeout)),
            };
            let err = match result {
                Ok(object) => return Ok(object),
                Err(e) => e,
            };

            if (err.is_retryable() || matches!(err, TransferError::SessionExpired(_)))
                && let Some(object) = self.assembled_object(session).await
            {
                info!(
                    key = %session.key.remote_key,
                    error = %err,
                    "completion reported failure but object is in place"
                );
                if object.modified < session.created_at {
                    self.abort_remote(session).await;
                }
                return Ok(object);
            }
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                session = %session.session_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "completion failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// The remote object, if it holds what the session uploaded.
    ///
    /// Size must match. A remote digest must equal the source digest; without
    /// one the object must have been written after the session started.
    async fn assembled_object(&self, session: &Session) -> Option<ObjectMeta> {
        let object = self
            .client
            .head_object(&session.key.volume_id, &session.key.remote_key)
            .await
            .ok()?;
        if object.size != session.plan.object_size() {
            return None;
        }
        let ours = match object.digest.as_deref() {
            Some(digest) => digest.eq_ignore_ascii_case(&session.source_digest),
            None => object.modified >= session.created_at,
        };
        ours.then_some(object)
    }

    /// Best-effort abort of an upload session's remote multipart state.
    async fn abort_remote(&self, session: &Session) {
        if session.key.kind != TransferKind::Upload {
            return;
        }
        match self.client.abort_multipart(&session.session_id).await {
            Ok(()) | Err(StorageError::NoSuchUpload(_)) => {
                debug!(session = %session.session_id, "aborted remote multipart session");
            }
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "failed to abort multipart session");
            }
        }
    }

    /// Applies the failure policy to `err` and hands it back.
    ///
    /// An expired session is forgotten; anything else leaves the record in
    /// place so the next attempt resumes.
    fn fail(&self, session: &mut Session, err: TransferError) -> TransferError {
        if matches!(err, TransferError::SessionExpired(_))
            && let Err(e) = self.store.delete(&session.key)
        {
            warn!(session = %session.session_id, error = %e, "failed to remove expired session");
        }
        session.fail();
        error!(
            key = %session.key.remote_key,
            session = %session.session_id,
            done = session.completed_count(),
            total = session.plan.part_count(),
            error = %err,
            "{} failed",
            session.key.kind.as_str()
        );
        err
    }
}

fn check_concurrency(concurrency: usize) -> Result<(), TransferError> {
    if concurrency == 0 {
        return Err(TransferError::InvalidConfiguration(
            "concurrency must be at least 1".into(),
        ));
    }
    Ok(())
}

fn keep_failure(slot: &mut Option<TransferError>, err: TransferError) {
    match slot {
        None => *slot = Some(err),
        Some(existing) if !existing.is_fatal() && err.is_fatal() => *slot = Some(err),
        Some(_) => {}
    }
}

/// Resume fingerprint of a remote object: its digest when exposed,
/// otherwise size and modification time (only trusted on opt-in).
fn remote_fingerprint(object: &ObjectMeta) -> String {
    match &object.digest {
        Some(digest) => digest.clone(),
        None => format!(
            "size:{}:modified:{}",
            object.size,
            object.modified.timestamp_millis()
        ),
    }
}

/// Per-attempt completion timeout: 5 s per started GiB, at least 60 s.
fn completion_timeout(object_size: u64) -> Duration {
    let gib = object_size.div_ceil(GIB) as u32;
    COMPLETE_TIMEOUT_PER_GIB
        .saturating_mul(gib)
        .max(MIN_COMPLETE_TIMEOUT)
}

/// Re-checks recorded parts against the staging file and forgets those that
/// no longer match. Returns how many were dropped.
async fn reverify_parts(session: &mut Session, writer: &PartWriter) -> Result<usize, TransferError> {
    let plan = session.plan;
    let recorded: Vec<(u32, String)> = session
        .completed_parts
        .values()
        .map(|r| (r.index, r.digest.clone()))
        .collect();
    let writer = writer.clone();
    let bad = tokio::task::spawn_blocking(move || -> Result<Vec<u32>, TransferError> {
        let mut bad = Vec::new();
        for (index, digest) in recorded {
            let data = writer.read_back(plan.part_offset(index), plan.part_len(index))?;
            if digest_part(&data) != digest {
                bad.push(index);
            }
        }
        Ok(bad)
    })
    .await??;
    for index in &bad {
        session.forget_part(*index);
    }
    Ok(bad.len())
}

async fn discard_staging(writer: PartWriter) {
    let path = writer.path().to_path_buf();
    let result = tokio::task::spawn_blocking(move || writer.discard()).await;
    if !matches!(result, Ok(Ok(()))) {
        warn!(path = %path.display(), "failed to remove staging file");
    }
}

fn log_finished(report: &TransferReport, meter: &TransferMeter) {
    let secs = report.elapsed.as_secs_f64();
    let mb_per_sec = if secs > 0.0 {
        report.bytes_transferred as f64 / (1024.0 * 1024.0) / secs
    } else {
        meter.average_mb_per_second()
    };
    info!(
        key = %report.remote_key,
        session = %report.session_id,
        size = report.object.size,
        parts = report.parts_transferred,
        resumed = report.parts_resumed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        mb_per_sec = %format!("{mb_per_sec:.2}"),
        "{} complete",
        report.kind.as_str()
    );
}
