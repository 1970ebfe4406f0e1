//! Bounded-concurrency execution of part transfers.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use volsync_protocol::StorageClient;

use crate::TransferError;
use crate::checksum::{digest_part, verify};
use crate::chunked::{PartWriter, read_part};
use crate::plan::TransferPlan;
use crate::retry::{RetryPolicy, with_retry};
use crate::types::PartRecord;

/// One attempt at moving a single part.
///
/// Implementations must be idempotent: the pool calls `run` again on
/// retryable failures.
#[async_trait]
pub trait PartTask: Send + Sync + 'static {
    fn index(&self) -> u32;

    async fn run(&self) -> Result<PartRecord, TransferError>;
}

/// Why a submitted part did not produce a record.
#[derive(Debug)]
pub enum PartFailure {
    /// Cancelled before a worker picked it up; nothing was sent.
    NotStarted(u32),
    Failed { index: u32, error: TransferError },
}

pub type PartResult = Result<PartRecord, PartFailure>;

/// Sends part `index` of a local file into an open multipart session.
pub struct UploadPart {
    client: Arc<dyn StorageClient>,
    session_id: String,
    local_path: PathBuf,
    plan: TransferPlan,
    index: u32,
}

impl UploadPart {
    pub fn new(
        client: Arc<dyn StorageClient>,
        session_id: impl Into<String>,
        local_path: impl Into<PathBuf>,
        plan: TransferPlan,
        index: u32,
    ) -> Self {
        Self {
            client,
            session_id: session_id.into(),
            local_path: local_path.into(),
            plan,
            index,
        }
    }
}

#[async_trait]
impl PartTask for UploadPart {
    fn index(&self) -> u32 {
        self.index
    }

    async fn run(&self) -> Result<PartRecord, TransferError> {
        let path = self.local_path.clone();
        let plan = self.plan;
        let index = self.index;
        let chunk = tokio::task::spawn_blocking(move || read_part(&path, &plan, index)).await??;

        let token = self
            .client
            .put_part(&self.session_id, index, &chunk.data)
            .await?;
        if let Some(echoed) = &token.digest {
            verify(Some(index), &chunk.digest, echoed)?;
        }
        Ok(PartRecord {
            index,
            digest: chunk.digest,
            token: token.etag,
        })
    }
}

/// Fetches part `index` of a remote object into a staging file.
pub struct DownloadPart {
    client: Arc<dyn StorageClient>,
    volume_id: String,
    remote_key: String,
    writer: PartWriter,
    plan: TransferPlan,
    index: u32,
}

impl DownloadPart {
    pub fn new(
        client: Arc<dyn StorageClient>,
        volume_id: impl Into<String>,
        remote_key: impl Into<String>,
        writer: PartWriter,
        plan: TransferPlan,
        index: u32,
    ) -> Self {
        Self {
            client,
            volume_id: volume_id.into(),
            remote_key: remote_key.into(),
            writer,
            plan,
            index,
        }
    }
}

#[async_trait]
impl PartTask for DownloadPart {
    fn index(&self) -> u32 {
        self.index
    }

    async fn run(&self) -> Result<PartRecord, TransferError> {
        let range = self.plan.part_range(self.index);
        let expected_len = range.end - range.start;
        let data = if expected_len == 0 {
            Vec::new()
        } else {
            self.client
                .get_range(&self.volume_id, &self.remote_key, range.clone())
                .await?
        };

        if data.len() as u64 != expected_len {
            return Err(TransferError::Integrity {
                part: Some(self.index),
                expected: format!("{expected_len} bytes"),
                actual: format!("{} bytes", data.len()),
            });
        }
        let digest = digest_part(&data);

        let writer = self.writer.clone();
        let offset = range.start;
        tokio::task::spawn_blocking(move || writer.write_part(offset, &data)).await??;

        Ok(PartRecord {
            index: self.index,
            digest,
            token: offset.to_string(),
        })
    }
}

/// Runs part tasks with at most `workers` in flight, each under the retry policy.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
    retry: RetryPolicy,
}

impl WorkerPool {
    pub fn new(workers: usize, retry: RetryPolicy) -> Result<Self, TransferError> {
        if workers == 0 {
            return Err(TransferError::InvalidConfiguration(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            retry,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Spawns `task`; it starts once a worker slot is free.
    ///
    /// If `cancel` fires before that, the task resolves to
    /// [`PartFailure::NotStarted`] without running. A started task runs to
    /// completion but makes no further attempts after cancellation.
    pub fn submit<T: PartTask>(&self, task: T, cancel: CancellationToken) -> JoinHandle<PartResult> {
        let permits = Arc::clone(&self.permits);
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let index = task.index();
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PartFailure::NotStarted(index)),
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(PartFailure::NotStarted(index)),
                },
            };
            if cancel.is_cancelled() {
                return Err(PartFailure::NotStarted(index));
            }

            debug!(part = index, "part started");
            let task = &task;
            let cancel = &cancel;
            let result = with_retry(&retry, "part transfer", |attempt| async move {
                if attempt > 1 && cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                task.run().await
            })
            .await;

            match result {
                Ok(record) => Ok(record),
                Err(error) if error.is_retryable() => Err(PartFailure::Failed {
                    index,
                    error: TransferError::PartTransferFailed {
                        index,
                        cause: Box::new(error),
                    },
                }),
                Err(error) => Err(PartFailure::Failed { index, error }),
            }
        })
    }
}
