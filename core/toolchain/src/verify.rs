//! Checksum verification for downloaded archives.
//!
//! This module provides SHA256 checksum verification to ensure downloaded
//! files match the hashes published in the manifest. Files are read in fixed
//! 8 KiB chunks, so memory use does not depend on archive size.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{Result, ToolchainError};

/// Read buffer size for hashing.
const CHUNK_SIZE: usize = 8192;

/// Verifies that a file matches the expected SHA256 checksum.
///
/// The comparison is case-insensitive on the expected value.
///
/// # Errors
///
/// Returns [`ToolchainError::Io`] if the file cannot be read and
/// [`ToolchainError::ChecksumMismatch`] if the digest differs.
///
/// # Example
///
/// ```ignore
/// verify_checksum(Path::new("toolchain.tar.zst"), "abc123...")?;
/// ```
pub fn verify_checksum(file_path: &Path, expected: &str) -> Result<()> {
    let actual = compute_sha256(file_path)?;
    check_digest(&file_path.display().to_string(), expected, &actual)
}

/// Compares a computed digest against the expected one.
///
/// `subject` names what was hashed in the resulting error.
///
/// # Errors
///
/// Returns [`ToolchainError::ChecksumMismatch`] if the digests differ.
pub fn check_digest(subject: &str, expected: &str, actual: &str) -> Result<()> {
    if actual.eq_ignore_ascii_case(expected.trim()) {
        tracing::debug!(subject, sha256 = actual, "checksum verified");
        Ok(())
    } else {
        tracing::error!(subject, expected, actual, "checksum mismatch");
        Err(ToolchainError::checksum_mismatch(subject, expected, actual))
    }
}

/// Computes the SHA256 hash of a file.
///
/// # Returns
///
/// The SHA256 hash as a lowercase hex string.
///
/// # Errors
///
/// Returns [`ToolchainError::Io`] if the file cannot be opened or read.
pub fn compute_sha256(file_path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(file_path)
        .map_err(|e| ToolchainError::io("Failed to open file for checksum", file_path, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ToolchainError::io("Failed to read file for checksum", file_path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Computes the SHA256 hash of an in-memory buffer.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
