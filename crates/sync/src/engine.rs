//! Caller-facing facade over single transfers, directory syncs and cleanup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use volsync_protocol::StorageClient;
use volsync_transfer::{
    MultipartManager, Reaper, SessionStore, TransferKind, TransferReport, TransferRequest,
};

use crate::config::{EngineConfig, TransferOptions};
use crate::error::SyncError;
use crate::reconciler::{Reconciler, SyncRequest, run_transfer};
use crate::types::{SyncDirection, SyncReport};

/// Entry point for hosts: one engine per storage client.
pub struct Engine {
    config: EngineConfig,
    manager: Arc<MultipartManager>,
    reconciler: Reconciler,
    reaper: Reaper,
}

impl Engine {
    /// Builds an engine with session records under the configured state
    /// directory.
    pub fn new(client: Arc<dyn StorageClient>, config: EngineConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let dir = config.state_dir().ok_or_else(|| {
            SyncError::InvalidConfiguration("no state directory: set stateDir or HOME".into())
        })?;
        let store = Arc::new(SessionStore::new(dir)?);
        Ok(Self::with_store(client, config, store))
    }

    /// Builds an engine around an existing session store.
    pub fn with_store(
        client: Arc<dyn StorageClient>,
        config: EngineConfig,
        store: Arc<SessionStore>,
    ) -> Self {
        let manager = Arc::new(MultipartManager::new(
            Arc::clone(&client),
            Arc::clone(&store),
            config.retry.clone(),
        ));
        Self {
            reconciler: Reconciler::new(Arc::clone(&client), Arc::clone(&manager)),
            reaper: Reaper::new(client, store),
            manager,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Default per-call options derived from the config.
    pub fn options(&self) -> TransferOptions {
        TransferOptions::from_config(&self.config)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.manager.store()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn upload_file(
        &self,
        local: &Path,
        volume_id: &str,
        remote_key: &str,
        options: &TransferOptions,
    ) -> Result<TransferReport, SyncError> {
        let request = file_request(local, volume_id, remote_key, options);
        Ok(run_transfer(
            &self.manager,
            TransferKind::Upload,
            request,
            options.restart_on_expired,
        )
        .await?)
    }

    pub async fn download_file(
        &self,
        volume_id: &str,
        remote_key: &str,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<TransferReport, SyncError> {
        if let Some(parent) = local.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let request = file_request(local, volume_id, remote_key, options);
        Ok(run_transfer(
            &self.manager,
            TransferKind::Download,
            request,
            options.restart_on_expired,
        )
        .await?)
    }

    /// Makes `prefix` on the volume mirror `local_root`.
    pub async fn sync_directory(
        &self,
        local_root: &Path,
        volume_id: &str,
        prefix: &str,
        options: &TransferOptions,
    ) -> Result<SyncReport, SyncError> {
        self.sync(local_root, volume_id, prefix, SyncDirection::Push, options)
            .await
    }

    /// Makes `local_root` mirror `prefix` on the volume.
    pub async fn download_directory(
        &self,
        volume_id: &str,
        prefix: &str,
        local_root: &Path,
        options: &TransferOptions,
    ) -> Result<SyncReport, SyncError> {
        self.sync(local_root, volume_id, prefix, SyncDirection::Pull, options)
            .await
    }

    /// Aborts uploads on the volume older than `max_age_hours`; returns how
    /// many were aborted.
    pub async fn cleanup_abandoned(
        &self,
        volume_id: &str,
        max_age_hours: u64,
    ) -> Result<usize, SyncError> {
        let age = Duration::from_secs(max_age_hours.saturating_mul(3600));
        let report = self.reaper.reap(volume_id, age).await?;
        Ok(report.aborted)
    }

    async fn sync(
        &self,
        local_root: &Path,
        volume_id: &str,
        prefix: &str,
        direction: SyncDirection,
        options: &TransferOptions,
    ) -> Result<SyncReport, SyncError> {
        if options.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let request = SyncRequest::new(local_root, volume_id, prefix, direction)
            .with_excludes(options.exclude_patterns.clone())
            .with_delete_orphans(options.delete_orphans);
        let plan = self.reconciler.plan(&request).await?;
        if plan.is_noop() {
            info!(volume = volume_id, prefix = %plan.remote_prefix, "already in sync");
        }
        self.reconciler.execute(&plan, options).await
    }
}

fn file_request(
    local: &Path,
    volume_id: &str,
    remote_key: &str,
    options: &TransferOptions,
) -> TransferRequest {
    TransferRequest::new(local, volume_id, remote_key)
        .with_chunk_size(options.chunk_size)
        .with_concurrency(options.concurrency)
        .with_resume(options.enable_resume)
        .with_size_mtime_resume(options.allow_size_mtime_resume)
        .with_progress(options.progress.clone())
        .with_cancel(options.cancel.clone())
}
