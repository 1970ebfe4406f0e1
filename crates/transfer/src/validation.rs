use crate::TransferError;

/// Checks that `key`, a remote key relative to a sync prefix, maps onto a
/// path below the local root.
///
/// Keys are `/`-separated. Rejected: empty keys, a leading `/`, segments
/// that are empty, `.` or `..`, backslashes, NUL bytes and a leading drive
/// (`C:`).
pub fn validate_relative_key(key: &str) -> Result<(), TransferError> {
    let invalid = |why: &str| -> Result<(), TransferError> {
        Err(TransferError::InvalidPath(format!("{why}: {key:?}")))
    };

    if key.is_empty() {
        return invalid("empty key");
    }
    if key.starts_with('/') {
        return invalid("absolute key");
    }
    if key.contains('\\') {
        return invalid("backslash in key");
    }
    if key.contains('\0') {
        return invalid("NUL in key");
    }

    for (position, segment) in key.split('/').enumerate() {
        match segment {
            "" => return invalid("empty segment in key"),
            "." | ".." => return invalid("dot segment in key"),
            _ if position == 0 && is_drive(segment) => return invalid("drive prefix in key"),
            _ => {}
        }
    }
    Ok(())
}

fn is_drive(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
