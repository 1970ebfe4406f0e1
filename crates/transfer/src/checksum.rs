use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::TransferError;

const READ_BUF: usize = 64 * 1024;

/// SHA-256 of `data`, hex-encoded.
pub fn digest_part(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of everything `reader` yields, hex-encoded.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a whole file, hex-encoded.
pub fn digest_file(path: &Path) -> Result<String, TransferError> {
    let file = std::fs::File::open(path)?;
    Ok(digest_reader(file)?)
}

/// Compares two digests, failing with [`TransferError::Integrity`].
pub(crate) fn verify(part: Option<u32>, expected: &str, actual: &str) -> Result<(), TransferError> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(TransferError::Integrity {
            part,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
