//! Engine configuration.
//!
//! Stored as camelCase JSON at `<config dir>/volsync/config.json`. Every
//! field has a default, so a partial or missing file is fine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use volsync_transfer::{
    DEFAULT_CONCURRENCY, ProgressSink, RetryPolicy, TransferError, config_dir, default_state_dir,
};

use crate::DEFAULT_FILE_CONCURRENCY;
use crate::error::SyncError;

/// Persistent engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Where session records live; `None` uses the platform default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Parts in flight per file.
    pub concurrency: usize,
    /// Files in flight per directory pass.
    pub file_concurrency: usize,
    pub retry: RetryPolicy,
    pub enable_resume: bool,
    /// Resume downloads of objects without a remote digest on size and
    /// modification time alone.
    pub allow_size_mtime_resume: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            concurrency: DEFAULT_CONCURRENCY,
            file_concurrency: DEFAULT_FILE_CONCURRENCY,
            retry: RetryPolicy::default(),
            enable_resume: true,
            allow_size_mtime_resume: false,
        }
    }
}

impl EngineConfig {
    /// Loads the user config file, falling back to defaults when it is
    /// missing or cannot be parsed.
    pub fn load() -> Result<Self, SyncError> {
        let Some(path) = config_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse engine config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Loads a config file strictly; parse errors are returned.
    pub fn load_from(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.concurrency == 0 {
            return Err(SyncError::InvalidConfiguration(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.file_concurrency == 0 {
            return Err(SyncError::InvalidConfiguration(
                "fileConcurrency must be at least 1".into(),
            ));
        }
        self.retry.validate().map_err(|e| match e {
            TransferError::InvalidConfiguration(msg) => SyncError::InvalidConfiguration(msg),
            other => SyncError::Transfer(other),
        })
    }

    /// Resolved session directory.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.clone().or_else(default_state_dir)
    }
}

/// Path of the user config file.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("volsync").join("config.json"))
}

/// Per-call knobs for the [`Engine`](crate::Engine) operations.
///
/// For directory operations the progress sink receives
/// `(files_done, files_total, relative_path)` instead of byte counts.
#[derive(Clone)]
pub struct TransferOptions {
    /// Part size override; `None` picks by object size.
    pub chunk_size: Option<u64>,
    pub concurrency: usize,
    pub file_concurrency: usize,
    pub enable_resume: bool,
    /// See [`EngineConfig::allow_size_mtime_resume`].
    pub allow_size_mtime_resume: bool,
    pub exclude_patterns: Vec<String>,
    pub delete_orphans: bool,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancellationToken,
    /// Start over once when the remote session has expired.
    pub restart_on_expired: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("chunk_size", &self.chunk_size)
            .field("concurrency", &self.concurrency)
            .field("file_concurrency", &self.file_concurrency)
            .field("enable_resume", &self.enable_resume)
            .field("allow_size_mtime_resume", &self.allow_size_mtime_resume)
            .field("exclude_patterns", &self.exclude_patterns)
            .field("delete_orphans", &self.delete_orphans)
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("restart_on_expired", &self.restart_on_expired)
            .finish()
    }
}

impl TransferOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            chunk_size: None,
            concurrency: config.concurrency,
            file_concurrency: config.file_concurrency,
            enable_resume: config.enable_resume,
            allow_size_mtime_resume: config.allow_size_mtime_resume,
            exclude_patterns: Vec::new(),
            delete_orphans: false,
            progress: None,
            cancel: CancellationToken::new(),
            restart_on_expired: true,
        }
    }

    pub fn with_excludes<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.exclude_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delete_orphans(mut self, delete_orphans: bool) -> Self {
        self.delete_orphans = delete_orphans;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_size_mtime_resume(mut self, allow: bool) -> Self {
        self.allow_size_mtime_resume = allow;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.file_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.enable_resume);
        assert!(!config.allow_size_mtime_resume);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"fileConcurrency": 8, "retry": {"maxAttempts": 2}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.file_concurrency, 8);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert!(config.state_dir.is_none());
        assert!(!config.allow_size_mtime_resume);

        let json = r#"{"allowSizeMtimeResume": true}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(config.allow_size_mtime_resume);
        assert!(TransferOptions::from_config(&config).allow_size_mtime_resume);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = EngineConfig {
            state_dir: Some(dir.path().join("sessions")),
            concurrency: 2,
            enable_resume: false,
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"stateDir\""));
        assert!(content.contains("\"enableResume\": false"));

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.state_dir(), Some(dir.path().join("sessions")));
    }

    #[test]
    fn load_from_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(SyncError::Json(_))));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = EngineConfig {
            file_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfiguration(_))
        ));

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn options_follow_config() {
        let config = EngineConfig {
            concurrency: 7,
            enable_resume: false,
            ..Default::default()
        };
        let options = TransferOptions::from_config(&config)
            .with_excludes(["*.tmp"])
            .with_delete_orphans(true);
        assert_eq!(options.concurrency, 7);
        assert!(!options.enable_resume);
        assert!(options.restart_on_expired);
        assert_eq!(options.exclude_patterns, vec!["*.tmp".to_string()]);
        assert!(options.delete_orphans);
    }
}
