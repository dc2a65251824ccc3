//! Cache of verified archives.
//!
//! Archives that passed verification are kept under
//! `<root>/.cache/archives/` so that reinstalling a purged target, or a
//! second install root sharing the cache, skips the download. Entries are
//! keyed by target and whole-archive SHA256 and re-verified on every lookup.

use std::path::{Path, PathBuf};

use crate::errors::{Result, ToolchainError};
use crate::target::Target;
use crate::verify::verify_checksum;

/// Extension of cache entries.
const ENTRY_EXTENSION: &str = "archive";

/// Verified archive store.
#[derive(Debug, Clone)]
pub struct ArchiveCache {
    dir: PathBuf,
}

impl ArchiveCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<ns>-<plat>-<arch>-<sha256>.archive`
    #[must_use]
    pub fn entry_path(&self, target: &Target, sha256: &str) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.{ENTRY_EXTENSION}",
            target.slug(),
            sha256.to_ascii_lowercase()
        ))
    }

    /// Returns the cached archive for `(target, sha256)` if it exists and
    /// still verifies.
    ///
    /// A corrupt entry is deleted and treated as a miss.
    #[must_use]
    pub fn lookup(&self, target: &Target, sha256: &str) -> Option<PathBuf> {
        let path = self.entry_path(target, sha256);
        if !path.is_file() {
            return None;
        }

        match verify_checksum(&path, sha256) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "archive cache hit");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding corrupt cache entry");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Copies a verified archive into the cache.
    ///
    /// The copy is written to a temporary file, re-verified and renamed into
    /// place, so a concurrent lookup never sees a partial entry.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] or [`ToolchainError::ChecksumMismatch`].
    /// Callers treat caching as best effort.
    pub fn store(&self, target: &Target, sha256: &str, archive: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ToolchainError::io("Failed to create archive cache", &self.dir, e))?;

        let path = self.entry_path(target, sha256);
        let tmp = tempfile::Builder::new()
            .prefix(".store-")
            .tempfile_in(&self.dir)
            .map_err(|e| ToolchainError::io("Failed to create cache temp file", &self.dir, e))?;

        std::fs::copy(archive, tmp.path())
            .map_err(|e| ToolchainError::io("Failed to copy archive into cache", archive, e))?;
        verify_checksum(tmp.path(), sha256)?;

        tmp.persist(&path)
            .map_err(|e| ToolchainError::io("Failed to commit cache entry", &path, e.error))?;
        tracing::debug!(path = %path.display(), "archive cached");
        Ok(path)
    }

    /// Removes every cache entry and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if the directory cannot be read or an
    /// entry cannot be removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.entries()? {
            std::fs::remove_file(&path)
                .map_err(|e| ToolchainError::io("Failed to remove cache entry", &path, e))?;
            removed += 1;
        }
        tracing::info!(removed, dir = %self.dir.display(), "archive cache cleared");
        Ok(removed)
    }

    /// Total size of all cache entries in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if the directory cannot be read.
    pub fn size_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for path in self.entries()? {
            total += std::fs::metadata(&path)
                .map_err(|e| ToolchainError::io("Failed to stat cache entry", &path, e))?
                .len();
        }
        Ok(total)
    }

    fn entries(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let read_dir = std::fs::read_dir(&self.dir)
            .map_err(|e| ToolchainError::io("Failed to read archive cache", &self.dir, e))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry
                .map_err(|e| ToolchainError::io("Failed to read archive cache", &self.dir, e))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                entries.push(path);
            }
        }
        Ok(entries)
    }
}
