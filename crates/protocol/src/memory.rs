//! In-process [`StorageClient`] backend.
//!
//! Keeps volumes, objects and open multipart sessions in memory, counts
//! every call, and can inject the failures the engine has to survive:
//! dropped connections, corrupted parts, expired sessions, dead keys.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::client::StorageClient;
use crate::error::StorageError;
use crate::types::{InProgressUpload, ListPage, ObjectMeta, PartToken};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Number of calls made per operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub initiate: usize,
    pub put_part: usize,
    pub complete: usize,
    pub abort: usize,
    pub get_range: usize,
    pub head: usize,
    pub list: usize,
    pub delete: usize,
    pub list_uploads: usize,
}

struct StoredObject {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

struct OpenUpload {
    volume_id: String,
    key: String,
    started_at: DateTime<Utc>,
    parts: BTreeMap<u32, (Vec<u8>, String)>,
}

#[derive(Default)]
struct Faults {
    /// After this many successful part uploads every further one fails.
    fail_put_after: Option<(usize, StorageError)>,
    put_successes: usize,
    /// Next N part uploads fail with a retryable 503.
    transient_puts: usize,
    /// Part index -> remaining number of corrupted receipts.
    corrupt_echo: HashMap<u32, usize>,
    /// Next N range reads return one byte short.
    truncated_reads: usize,
    /// Every call touching one of these keys fails.
    failing_keys: HashMap<String, StorageError>,
}

struct Inner {
    volumes: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, OpenUpload>,
    calls: CallCounts,
    faults: Faults,
    page_size: usize,
    expose_digests: bool,
}

/// In-memory storage backend with call counting and fault injection.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty backend with no volumes.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                volumes: HashMap::new(),
                uploads: HashMap::new(),
                calls: CallCounts::default(),
                faults: Faults::default(),
                page_size: DEFAULT_PAGE_SIZE,
                expose_digests: true,
            }),
        }
    }

    /// Creates an empty volume. Existing volumes are left untouched.
    pub fn create_volume(&self, volume_id: &str) {
        let mut s = self.inner.lock().unwrap();
        s.volumes.entry(volume_id.to_string()).or_default();
    }

    /// Stores an object directly, stamped with the current time.
    pub fn put_object(&self, volume_id: &str, key: &str, data: &[u8]) {
        self.put_object_at(volume_id, key, data, Utc::now());
    }

    /// Stores an object directly with an explicit modification time.
    pub fn put_object_at(&self, volume_id: &str, key: &str, data: &[u8], modified: DateTime<Utc>) {
        let mut s = self.inner.lock().unwrap();
        s.volumes.entry(volume_id.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                modified,
            },
        );
    }

    /// Returns a copy of an object's content.
    pub fn object(&self, volume_id: &str, key: &str) -> Option<Vec<u8>> {
        let s = self.inner.lock().unwrap();
        s.volumes
            .get(volume_id)
            .and_then(|v| v.get(key))
            .map(|o| o.data.clone())
    }

    /// Returns all keys in a volume, sorted.
    pub fn keys(&self, volume_id: &str) -> Vec<String> {
        let s = self.inner.lock().unwrap();
        s.volumes
            .get(volume_id)
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of multipart sessions still open on a volume.
    pub fn open_sessions(&self, volume_id: &str) -> usize {
        let s = self.inner.lock().unwrap();
        s.uploads
            .values()
            .filter(|u| u.volume_id == volume_id)
            .count()
    }

    /// Number of parts received so far by an open session.
    pub fn received_parts(&self, session_id: &str) -> usize {
        let s = self.inner.lock().unwrap();
        s.uploads.get(session_id).map_or(0, |u| u.parts.len())
    }

    /// Snapshot of the call counters.
    pub fn calls(&self) -> CallCounts {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Zeroes the call counters.
    pub fn reset_calls(&self) {
        self.inner.lock().unwrap().calls = CallCounts::default();
    }

    /// Lets `successes` part uploads through, then fails every later one with `error`.
    pub fn fail_put_after(&self, successes: usize, error: StorageError) {
        let mut s = self.inner.lock().unwrap();
        s.faults.fail_put_after = Some((successes, error));
        s.faults.put_successes = 0;
    }

    /// Fails the next `count` part uploads with a retryable 503.
    pub fn fail_transient_puts(&self, count: usize) {
        self.inner.lock().unwrap().faults.transient_puts = count;
    }

    /// Corrupts the stored bytes of `part_index` for its next `times` uploads.
    pub fn corrupt_part(&self, part_index: u32, times: usize) {
        let mut s = self.inner.lock().unwrap();
        s.faults.corrupt_echo.insert(part_index, times);
    }

    /// Makes the next `count` range reads return one byte short.
    pub fn truncate_reads(&self, count: usize) {
        self.inner.lock().unwrap().faults.truncated_reads = count;
    }

    /// Fails every operation that touches `key`.
    pub fn fail_key(&self, key: &str, error: StorageError) {
        let mut s = self.inner.lock().unwrap();
        s.faults.failing_keys.insert(key.to_string(), error);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.inner.lock().unwrap().faults = Faults::default();
    }

    /// Drops an open session as if the remote expired it.
    pub fn expire_session(&self, session_id: &str) {
        self.inner.lock().unwrap().uploads.remove(session_id);
    }

    /// Rewrites the start time of an open session.
    pub fn backdate_upload(&self, session_id: &str, started_at: DateTime<Utc>) {
        let mut s = self.inner.lock().unwrap();
        if let Some(upload) = s.uploads.get_mut(session_id) {
            upload.started_at = started_at;
        }
    }

    /// Controls whether head/list/complete report content digests.
    pub fn set_expose_digests(&self, expose: bool) {
        self.inner.lock().unwrap().expose_digests = expose;
    }

    /// Sets the listing page size.
    pub fn set_page_size(&self, page_size: usize) {
        self.inner.lock().unwrap().page_size = page_size.max(1);
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl Inner {
    fn check_key(&self, key: &str) -> Result<(), StorageError> {
        match self.faults.failing_keys.get(key) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn volume(&self, volume_id: &str) -> Result<&BTreeMap<String, StoredObject>, StorageError> {
        self.volumes
            .get(volume_id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {volume_id}")))
    }

    fn meta(&self, key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: object.data.len() as u64,
            modified: object.modified,
            digest: self.expose_digests.then(|| sha256_hex(&object.data)),
        }
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn initiate_multipart(
        &self,
        volume_id: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.initiate += 1;
        s.check_key(key)?;
        s.volume(volume_id)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        s.uploads.insert(
            session_id.clone(),
            OpenUpload {
                volume_id: volume_id.to_string(),
                key: key.to_string(),
                started_at: Utc::now(),
                parts: BTreeMap::new(),
            },
        );
        Ok(session_id)
    }

    async fn put_part(
        &self,
        session_id: &str,
        part_index: u32,
        data: &[u8],
    ) -> Result<PartToken, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.put_part += 1;

        let key = match s.uploads.get(session_id) {
            Some(upload) => upload.key.clone(),
            None => return Err(StorageError::NoSuchUpload(session_id.to_string())),
        };
        s.check_key(&key)?;

        if s.faults.transient_puts > 0 {
            s.faults.transient_puts -= 1;
            return Err(StorageError::from_status(503, "slow down"));
        }
        if let Some((limit, err)) = &s.faults.fail_put_after
            && s.faults.put_successes >= *limit
        {
            return Err(err.clone());
        }

        let mut stored = data.to_vec();
        if let Some(remaining) = s.faults.corrupt_echo.get_mut(&part_index)
            && *remaining > 0
        {
            *remaining -= 1;
            match stored.first_mut() {
                Some(b) => *b ^= 0xff,
                None => stored.push(0),
            }
        }

        let digest = sha256_hex(&stored);
        let etag = format!("\"{}\"", &digest[..32]);
        s.faults.put_successes += 1;
        if let Some(upload) = s.uploads.get_mut(session_id) {
            upload.parts.insert(part_index, (stored, etag.clone()));
        }
        Ok(PartToken {
            index: part_index,
            etag,
            digest: Some(digest),
        })
    }

    async fn complete_multipart(
        &self,
        session_id: &str,
        parts: &[PartToken],
    ) -> Result<ObjectMeta, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.complete += 1;

        let Some(upload) = s.uploads.get(session_id) else {
            return Err(StorageError::NoSuchUpload(session_id.to_string()));
        };
        s.check_key(&upload.key)?;

        let mut data = Vec::new();
        for (position, token) in parts.iter().enumerate() {
            if token.index as usize != position {
                return Err(StorageError::InvalidRequest(format!(
                    "parts out of order at position {position}"
                )));
            }
            match upload.parts.get(&token.index) {
                Some((bytes, etag)) if *etag == token.etag => data.extend_from_slice(bytes),
                Some(_) => {
                    return Err(StorageError::InvalidRequest(format!(
                        "etag mismatch for part {}",
                        token.index
                    )));
                }
                None => {
                    return Err(StorageError::InvalidRequest(format!(
                        "part {} was never uploaded",
                        token.index
                    )));
                }
            }
        }

        let Some(upload) = s.uploads.remove(session_id) else {
            return Err(StorageError::NoSuchUpload(session_id.to_string()));
        };
        let object = StoredObject {
            data,
            modified: Utc::now(),
        };
        let meta = s.meta(&upload.key, &object);
        s.volumes
            .entry(upload.volume_id)
            .or_default()
            .insert(upload.key, object);
        Ok(meta)
    }

    async fn abort_multipart(&self, session_id: &str) -> Result<(), StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.abort += 1;
        match s.uploads.remove(session_id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NoSuchUpload(session_id.to_string())),
        }
    }

    async fn get_range(
        &self,
        volume_id: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.get_range += 1;
        s.check_key(key)?;

        let object = s
            .volume(volume_id)?
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let len = object.data.len() as u64;
        if range.start > range.end || range.end > len {
            return Err(StorageError::InvalidRequest(format!(
                "range {}..{} outside object of {len} bytes",
                range.start, range.end
            )));
        }
        let mut bytes = object.data[range.start as usize..range.end as usize].to_vec();

        if s.faults.truncated_reads > 0 && !bytes.is_empty() {
            s.faults.truncated_reads -= 1;
            bytes.pop();
        }
        Ok(bytes)
    }

    async fn head_object(&self, volume_id: &str, key: &str) -> Result<ObjectMeta, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.head += 1;
        s.check_key(key)?;
        let object = s
            .volume(volume_id)?
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(s.meta(key, object))
    }

    async fn list_objects(
        &self,
        volume_id: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.list += 1;

        let volume = s.volume(volume_id)?;
        let mut entries = Vec::new();
        let mut next = None;
        for (key, object) in volume.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(after) = continuation
                && key.as_str() <= after
            {
                continue;
            }
            if entries.len() == s.page_size {
                next = entries.last().map(|m: &ObjectMeta| m.key.clone());
                break;
            }
            entries.push(s.meta(key, object));
        }
        Ok(ListPage { entries, next })
    }

    async fn delete_object(&self, volume_id: &str, key: &str) -> Result<(), StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.delete += 1;
        s.check_key(key)?;
        s.volumes
            .get_mut(volume_id)
            .ok_or_else(|| StorageError::NotFound(format!("volume {volume_id}")))?
            .remove(key);
        Ok(())
    }

    async fn list_in_progress_uploads(
        &self,
        volume_id: &str,
    ) -> Result<Vec<InProgressUpload>, StorageError> {
        let mut s = self.inner.lock().unwrap();
        s.calls.list_uploads += 1;
        s.volume(volume_id)?;
        let mut uploads: Vec<InProgressUpload> = s
            .uploads
            .iter()
            .filter(|(_, u)| u.volume_id == volume_id)
            .map(|(id, u)| InProgressUpload {
                session_id: id.clone(),
                key: u.key.clone(),
                started_at: u.started_at,
            })
            .collect();
        uploads.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.create_volume("vol");
        storage
    }

    #[tokio::test]
    async fn multipart_roundtrip_assembles_in_order() {
        let s = storage();
        let id = s.initiate_multipart("vol", "big.bin").await.unwrap();
        let t1 = s.put_part(&id, 1, b"world").await.unwrap();
        let t0 = s.put_part(&id, 0, b"hello ").await.unwrap();

        let meta = s.complete_multipart(&id, &[t0, t1]).await.unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(s.object("vol", "big.bin").unwrap(), b"hello world");
        assert_eq!(meta.digest.unwrap(), sha256_hex(b"hello world"));
        assert_eq!(s.open_sessions("vol"), 0);
    }

    #[tokio::test]
    async fn unknown_volume_is_not_found() {
        let s = storage();
        let err = s.initiate_multipart("nope", "k").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_session_rejects_parts() {
        let s = storage();
        let id = s.initiate_multipart("vol", "k").await.unwrap();
        s.expire_session(&id);
        let err = s.put_part(&id, 0, b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::NoSuchUpload(_)));
    }

    #[tokio::test]
    async fn corrupted_part_echoes_a_different_digest() {
        let s = storage();
        let id = s.initiate_multipart("vol", "k").await.unwrap();
        s.corrupt_part(0, 1);

        let bad = s.put_part(&id, 0, b"abc").await.unwrap();
        assert_ne!(bad.digest.as_deref(), Some(sha256_hex(b"abc").as_str()));

        let good = s.put_part(&id, 0, b"abc").await.unwrap();
        assert_eq!(good.digest.as_deref(), Some(sha256_hex(b"abc").as_str()));
    }

    #[tokio::test]
    async fn fail_put_after_lets_n_parts_through() {
        let s = storage();
        let id = s.initiate_multipart("vol", "k").await.unwrap();
        s.fail_put_after(2, StorageError::Authentication("revoked".into()));

        assert!(s.put_part(&id, 0, b"a").await.is_ok());
        assert!(s.put_part(&id, 1, b"b").await.is_ok());
        assert!(matches!(
            s.put_part(&id, 2, b"c").await,
            Err(StorageError::Authentication(_))
        ));
        assert_eq!(s.received_parts(&id), 2);
    }

    #[tokio::test]
    async fn listing_paginates_under_prefix() {
        let s = storage();
        for name in ["data/a", "data/b", "data/c", "other/d"] {
            s.put_object("vol", name, b"x");
        }
        s.set_page_size(2);

        let first = s.list_objects("vol", "data/", None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        let token = first.next.clone().unwrap();

        let second = s.list_objects("vol", "data/", Some(&token)).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].key, "data/c");
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn range_reads_are_bounded() {
        let s = storage();
        s.put_object("vol", "k", b"0123456789");
        assert_eq!(s.get_range("vol", "k", 2..5).await.unwrap(), b"234");
        assert!(s.get_range("vol", "k", 8..11).await.is_err());
    }

    #[tokio::test]
    async fn hidden_digests_are_omitted() {
        let s = storage();
        s.put_object("vol", "k", b"abc");
        s.set_expose_digests(false);
        assert!(s.head_object("vol", "k").await.unwrap().digest.is_none());
    }
}
