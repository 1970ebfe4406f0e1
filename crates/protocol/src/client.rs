//! Storage client trait.

use std::ops::Range;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{InProgressUpload, ListPage, ObjectMeta, PartToken};

/// Operations the transfer engine needs from a remote volume.
///
/// Implementations must be safe for concurrent independent calls; the
/// engine issues part uploads and range reads from several tasks at once.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Starts a multipart session for `key` and returns its id.
    async fn initiate_multipart(&self, volume_id: &str, key: &str)
    -> Result<String, StorageError>;

    /// Uploads one part of an open multipart session.
    async fn put_part(
        &self,
        session_id: &str,
        part_index: u32,
        data: &[u8],
    ) -> Result<PartToken, StorageError>;

    /// Assembles the object from the given parts (sorted by index).
    async fn complete_multipart(
        &self,
        session_id: &str,
        parts: &[PartToken],
    ) -> Result<ObjectMeta, StorageError>;

    /// Discards an open multipart session and its parts.
    async fn abort_multipart(&self, session_id: &str) -> Result<(), StorageError>;

    /// Reads the byte range `range` (end exclusive) of an object.
    async fn get_range(
        &self,
        volume_id: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Vec<u8>, StorageError>;

    /// Returns object metadata, or [`StorageError::NotFound`].
    async fn head_object(&self, volume_id: &str, key: &str) -> Result<ObjectMeta, StorageError>;

    /// Lists one page of objects under `prefix`.
    async fn list_objects(
        &self,
        volume_id: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, StorageError>;

    /// Deletes an object.
    async fn delete_object(&self, volume_id: &str, key: &str) -> Result<(), StorageError>;

    /// Lists multipart sessions that are still open on the volume.
    async fn list_in_progress_uploads(
        &self,
        volume_id: &str,
    ) -> Result<Vec<InProgressUpload>, StorageError>;
}
