//! SHA-256 checksum calculation for file verification.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the SHA-256 checksum of a file.
///
/// Returns the lowercase hexadecimal digest of the file contents.
pub fn calculate_file_checksum(path: &Path) -> SyncResult<String> {
    let mut hasher = Sha256::new();
    hash_file_into(path, &mut hasher)?;
    Ok(hex_digest(hasher))
}

/// Feed a file's full contents into `hasher`, returning the bytes read.
pub fn hash_file_into(path: &Path, hasher: &mut Sha256) -> SyncResult<u64> {
    let mut file = File::open(path).map_err(|e| SyncError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| SyncError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok(total)
}

/// Finish a hasher into a lowercase hex string.
pub fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Case-insensitive comparison of two hex digests.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected)
}
