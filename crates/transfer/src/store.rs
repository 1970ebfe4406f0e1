use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::TransferError;
use crate::types::{Session, SessionKey, SessionState};

/// Outcome of looking up a stored session for resume.
#[derive(Debug)]
pub enum ResumeLookup {
    /// The stored session matches the current source and may be continued.
    Resume(Session),
    /// A record existed but no longer applies; it has been deleted.
    Discarded(Session),
    /// Nothing stored for the key.
    Missing,
}

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Durable per-key transfer state: one JSON file per session.
pub struct SessionStore {
    dir: PathBuf,
    locks: Arc<Mutex<LockMap>>,
}

/// Exclusive hold on one session key.
///
/// Dropping it releases the key and forgets its mutex once nobody else is
/// waiting on it.
pub struct SessionLock {
    guard: Option<OwnedMutexGuard<()>>,
    name: String,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap();
        if locks
            .get(&self.name)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

impl SessionStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_lock(&self, key: &SessionKey) -> (String, Arc<tokio::sync::Mutex<()>>) {
        let name = key.storage_name();
        let mut locks = self.locks.lock().unwrap();
        let mutex = locks.entry(name.clone()).or_default().clone();
        (name, mutex)
    }

    fn hold(&self, name: String, guard: OwnedMutexGuard<()>) -> SessionLock {
        SessionLock {
            guard: Some(guard),
            name,
            locks: Arc::clone(&self.locks),
        }
    }

    /// Waits for exclusive ownership of `key`.
    ///
    /// The guard must be held for the whole transfer.
    pub async fn lock(&self, key: &SessionKey) -> SessionLock {
        let (name, mutex) = self.key_lock(key);
        let guard = mutex.lock_owned().await;
        self.hold(name, guard)
    }

    /// Takes ownership of `key` only if nobody else holds it.
    pub fn try_lock(&self, key: &SessionKey) -> Option<SessionLock> {
        let (name, mutex) = self.key_lock(key);
        let guard = mutex.try_lock_owned().ok()?;
        Some(self.hold(name, guard))
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.storage_name()))
    }

    /// Loads the stored session for `key`, if any.
    pub fn load(&self, key: &SessionKey) -> Result<Option<Session>, TransferError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        let session: Session = serde_json::from_str(&data)?;
        Ok(Some(session))
    }

    /// Loads the session for `key` and checks it can resume a source whose
    /// fingerprint is `source_digest`. Stale records are deleted.
    pub fn load_resumable(
        &self,
        key: &SessionKey,
        source_digest: &str,
    ) -> Result<ResumeLookup, TransferError> {
        let session = match self.load(key) {
            Ok(Some(s)) => s,
            Ok(None) => return Ok(ResumeLookup::Missing),
            Err(TransferError::Json(e)) => {
                warn!(key = %key.remote_key, error = %e, "discarding unreadable session record");
                self.delete(key)?;
                return Ok(ResumeLookup::Missing);
            }
            Err(e) => return Err(e),
        };
        if session.is_resumable_with(source_digest) {
            return Ok(ResumeLookup::Resume(session));
        }
        debug!(
            key = %key.remote_key,
            session = %session.session_id,
            state = ?session.state,
            "stored session no longer matches source, discarding"
        );
        self.delete(key)?;
        Ok(ResumeLookup::Discarded(session))
    }

    /// Like [`load_resumable`](Self::load_resumable), but only returns a
    /// session that can be continued.
    pub fn load_verified(
        &self,
        key: &SessionKey,
        source_digest: &str,
    ) -> Result<Option<Session>, TransferError> {
        match self.load_resumable(key, source_digest)? {
            ResumeLookup::Resume(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    /// Persists `session`, replacing any earlier record atomically.
    pub fn save(&self, session: &Session) -> Result<(), TransferError> {
        let path = self.path_for(&session.key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(
            session = %session.session_id,
            parts = session.completed_count(),
            "persisted session"
        );
        Ok(())
    }

    /// Removes the record for `key`. Returns whether one existed.
    pub fn delete(&self, key: &SessionKey) -> Result<bool, TransferError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable stored sessions. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Session>, TransferError> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(TransferError::from)
                .and_then(|data| serde_json::from_str::<Session>(&data).map_err(Into::into));
            match parsed {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Sessions not updated within `older_than`, plus finished ones.
    pub fn list_stale(&self, older_than: Duration) -> Result<Vec<Session>, TransferError> {
        let age = TimeDelta::from_std(older_than).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now().checked_sub_signed(age);
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| {
                s.state != SessionState::InProgress
                    || cutoff.is_some_and(|cutoff| s.last_updated_at < cutoff)
            })
            .collect())
    }
}

/// Default directory for session records: `<config dir>/volsync/sessions`.
pub fn default_state_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("volsync").join("sessions"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
