//! Chunk planning: object size -> part layout.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::TransferError;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Largest part the storage protocol accepts.
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// Most parts a single multipart session may have.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Size tiers: objects below `limit` use `chunk`.
const TIERS: [(u64, u64); 3] = [(GIB, 10 * MIB), (10 * GIB, 50 * MIB), (50 * GIB, 100 * MIB)];
const LARGEST_TIER_CHUNK: u64 = 200 * MIB;

/// Immutable part layout of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlan {
    object_size: u64,
    chunk_size: u64,
    part_count: u32,
}

impl TransferPlan {
    fn with_chunk(object_size: u64, chunk_size: u64) -> Self {
        let parts = object_size.div_ceil(chunk_size).max(1);
        Self {
            object_size,
            chunk_size,
            part_count: parts as u32,
        }
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    /// All part indices, `0..part_count`.
    pub fn indices(&self) -> Range<u32> {
        0..self.part_count
    }

    /// Byte offset where part `index` starts.
    pub fn part_offset(&self, index: u32) -> u64 {
        (index as u64 * self.chunk_size).min(self.object_size)
    }

    /// Length of part `index`; only the last part may be short.
    pub fn part_len(&self, index: u32) -> u64 {
        let start = self.part_offset(index);
        (start + self.chunk_size).min(self.object_size) - start
    }

    /// Byte range (end exclusive) covered by part `index`.
    pub fn part_range(&self, index: u32) -> Range<u64> {
        let start = self.part_offset(index);
        start..start + self.part_len(index)
    }
}

/// Chunk size the tier table assigns to an object of `object_size` bytes.
pub fn tier_chunk_size(object_size: u64) -> u64 {
    TIERS
        .iter()
        .find(|(limit, _)| object_size < *limit)
        .map_or(LARGEST_TIER_CHUNK, |(_, chunk)| *chunk)
}

/// Plans a transfer using the size tiers.
///
/// Objects too large for the top tier to stay within [`MAX_PART_COUNT`]
/// get the smallest whole-MiB chunk that does.
pub fn plan(object_size: u64) -> TransferPlan {
    let mut chunk = tier_chunk_size(object_size);
    if object_size.div_ceil(chunk) > MAX_PART_COUNT {
        chunk = object_size.div_ceil(MAX_PART_COUNT).div_ceil(MIB) * MIB;
    }
    TransferPlan::with_chunk(object_size, chunk)
}

/// Plans a transfer, honouring an explicit chunk size when given.
pub fn plan_with(object_size: u64, chunk_size: Option<u64>) -> Result<TransferPlan, TransferError> {
    let Some(chunk) = chunk_size else {
        return Ok(plan(object_size));
    };
    if chunk == 0 {
        return Err(TransferError::InvalidConfiguration(
            "chunk size must be positive".into(),
        ));
    }
    if chunk > MAX_PART_SIZE {
        return Err(TransferError::InvalidConfiguration(format!(
            "chunk size {chunk} exceeds the maximum part size of {MAX_PART_SIZE} bytes"
        )));
    }
    let parts = object_size.div_ceil(chunk);
    if parts > MAX_PART_COUNT {
        return Err(TransferError::InvalidConfiguration(format!(
            "chunk size {chunk} splits {object_size} bytes into {parts} parts \
             (maximum {MAX_PART_COUNT})"
        )));
    }
    Ok(TransferPlan::with_chunk(object_size, chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_use_inclusive_lower_bounds() {
        assert_eq!(tier_chunk_size(0), 10 * MIB);
        assert_eq!(tier_chunk_size(GIB - 1), 10 * MIB);
        assert_eq!(tier_chunk_size(GIB), 50 * MIB);
        assert_eq!(tier_chunk_size(10 * GIB - 1), 50 * MIB);
        assert_eq!(tier_chunk_size(10 * GIB), 100 * MIB);
        assert_eq!(tier_chunk_size(50 * GIB), 200 * MIB);
        assert_eq!(tier_chunk_size(900 * GIB), 200 * MIB);
    }

    #[test]
    fn part_count_covers_object() {
        let sizes = [
            0,
            1,
            10 * MIB - 1,
            10 * MIB,
            10 * MIB + 1,
            GIB - 1,
            GIB,
            3 * GIB + 17,
            12 * GIB,
            50 * GIB + 5,
            1024 * GIB,
            3 * 1024 * GIB,
        ];
        for size in sizes {
            let p = plan(size);
            assert!(p.part_count() >= 1);
            assert!(p.part_count() as u64 * p.chunk_size() >= size, "size {size}");
            assert_eq!(p.part_count() as u64, size.div_ceil(p.chunk_size()).max(1));
            assert!(p.part_count() as u64 <= MAX_PART_COUNT);
        }
    }

    #[test]
    fn twelve_gib_plans_246_parts() {
        let p = plan(12 * GIB);
        assert_eq!(p.chunk_size(), 50 * MIB);
        assert_eq!(p.part_count(), 246);
        assert_eq!(p.part_len(0), 50 * MIB);
        assert_eq!(p.part_len(244), 50 * MIB);
        let last = p.part_len(245);
        assert!(last > 0 && last < 50 * MIB);
        assert_eq!(245 * 50 * MIB + last, 12 * GIB);

        // 100 parts done, 146 left.
        assert_eq!(p.indices().skip(100).count(), 146);
    }

    #[test]
    fn empty_object_is_one_empty_part() {
        let p = plan(0);
        assert_eq!(p.part_count(), 1);
        assert_eq!(p.part_len(0), 0);
        assert_eq!(p.part_range(0), 0..0);
    }

    #[test]
    fn small_object_is_one_part() {
        let p = plan(1234);
        assert_eq!(p.part_count(), 1);
        assert_eq!(p.part_range(0), 0..1234);
    }

    #[test]
    fn ranges_are_contiguous() {
        let p = plan_with(1000, Some(300)).unwrap();
        assert_eq!(p.part_count(), 4);
        let ranges: Vec<_> = p.indices().map(|i| p.part_range(i)).collect();
        assert_eq!(ranges, vec![0..300, 300..600, 600..900, 900..1000]);
    }

    #[test]
    fn override_is_validated() {
        assert!(matches!(
            plan_with(100, Some(0)),
            Err(TransferError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            plan_with(100, Some(MAX_PART_SIZE + 1)),
            Err(TransferError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            plan_with(MAX_PART_COUNT + 1, Some(1)),
            Err(TransferError::InvalidConfiguration(_))
        ));
        assert!(plan_with(MAX_PART_COUNT, Some(1)).is_ok());
    }

    #[test]
    fn huge_objects_grow_the_chunk() {
        let size = 4 * 1024 * GIB;
        let p = plan(size);
        assert!(p.chunk_size() > 200 * MIB);
        assert_eq!(p.chunk_size() % MIB, 0);
        assert!(p.part_count() as u64 <= MAX_PART_COUNT);
    }
}
