use std::ffi::OsString;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::TransferError;
use crate::checksum::digest_part;
use crate::plan::TransferPlan;

const PARTIAL_SUFFIX: &str = ".volsync-part";

/// One part of a file, read from disk with its digest.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
    pub digest: String,
}

/// Reads part `index` of `path` according to `plan`.
///
/// Fails if the file is shorter than the plan expects.
pub fn read_part(path: &Path, plan: &TransferPlan, index: u32) -> Result<Chunk, TransferError> {
    let range = plan.part_range(index);
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut data = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut data)?;
    let digest = digest_part(&data);
    Ok(Chunk {
        index,
        offset: range.start,
        data,
        digest,
    })
}

/// Where a download of `local` is staged until it completes.
pub fn partial_path(local: &Path) -> PathBuf {
    let mut name: OsString = local.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Writes downloaded parts into a pre-sized staging file at exact offsets.
#[derive(Debug, Clone)]
pub struct PartWriter {
    path: PathBuf,
}

impl PartWriter {
    /// Creates (or truncates) the staging file and sizes it to `size` bytes.
    pub fn create(path: &Path, size: u64) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Reopens an existing staging file of the expected size.
    ///
    /// Returns `Ok(None)` when the file is missing or has the wrong length.
    pub fn open(path: &Path, size: u64) -> Result<Option<Self>, TransferError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() == size => Ok(Some(Self {
                path: path.to_path_buf(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` at `offset` and flushes it to disk.
    pub fn write_part(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let mut file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads `len` bytes back from `offset`.
    pub fn read_back(&self, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Moves the staging file into place at `dest`.
    pub fn finish(self, dest: &Path) -> Result<(), TransferError> {
        std::fs::rename(&self.path, dest)?;
        Ok(())
    }

    /// Removes the staging file; a missing file is not an error.
    pub fn discard(self) -> Result<(), TransferError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
