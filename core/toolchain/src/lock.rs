//! Per-target advisory file locks.
//!
//! Installs of the same target are serialized through an exclusive OS lock on
//! `<root>/<namespace>-<platform>-<arch>.lock`. The lock belongs to an open
//! file descriptor, so it is released when the guard is dropped, when the
//! thread unwinds and when the process dies.
//!
//! A holder may unlink the lock file before releasing it (see
//! [`InstallLock::remove_on_release`]), so an install leaves no lock file
//! behind. Waiters that locked the unlinked file notice that the path no
//! longer names their descriptor and start over on a fresh file. On Windows
//! the file is kept.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;

use crate::errors::{Result, ToolchainError};

/// Interval between lock attempts when waiting with a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// RAII guard for an exclusive install lock.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct InstallLock {
    _file: File,
    path: PathBuf,
    remove_on_release: bool,
}

impl InstallLock {
    /// Acquires the exclusive lock at `path`, creating the file if needed.
    ///
    /// With `timeout` set to `None` this blocks until the lock is available.
    /// Otherwise it polls until the timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::LockTimeout`] if the timeout elapses and
    /// [`ToolchainError::Io`] if the lock file cannot be opened or locked.
    pub fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            let file = open_lock_file(path)?;
            match timeout {
                None => {
                    if !try_lock(&file, path)? {
                        if !announced {
                            tracing::info!(lock = %path.display(), "waiting for another install to finish");
                            announced = true;
                        }
                        file.lock_exclusive()
                            .map_err(|e| ToolchainError::io("Failed to lock", path, e))?;
                    }
                }
                Some(timeout) => {
                    while !try_lock(&file, path)? {
                        let waited = started.elapsed();
                        if waited >= timeout {
                            tracing::warn!(lock = %path.display(), ?waited, "lock wait timed out");
                            return Err(ToolchainError::LockTimeout {
                                path: path.to_path_buf(),
                                waited,
                            });
                        }
                        if !announced {
                            tracing::info!(lock = %path.display(), ?timeout, "waiting for another install to finish");
                            announced = true;
                        }
                        std::thread::sleep(POLL_INTERVAL.min(timeout - waited));
                    }
                }
            }

            if still_linked(&file, path) {
                tracing::debug!(lock = %path.display(), waited = ?started.elapsed(), "lock acquired");
                return Ok(Self::new(file, path));
            }
            tracing::debug!(lock = %path.display(), "lock file was removed by its holder, retrying");
        }
    }

    /// Attempts to acquire the lock without waiting.
    ///
    /// Returns `None` if another holder has it.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if the lock file cannot be opened or the
    /// lock call fails for a reason other than contention.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        loop {
            let file = open_lock_file(path)?;
            if !try_lock(&file, path)? {
                return Ok(None);
            }
            if still_linked(&file, path) {
                return Ok(Some(Self::new(file, path)));
            }
        }
    }

    /// Unlinks the lock file when the guard is dropped, while it is still
    /// held. No-op on Windows.
    pub fn remove_on_release(&mut self) {
        self.remove_on_release = true;
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn new(file: File, path: &Path) -> Self {
        Self {
            _file: file,
            path: path.to_path_buf(),
            remove_on_release: false,
        }
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if self.remove_on_release {
            unlink_lock_file(&self.path);
        }
        // The descriptor closes right after this, which releases the lock.
        tracing::debug!(lock = %self.path.display(), "lock released");
    }
}

#[cfg(unix)]
fn unlink_lock_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        tracing::warn!(lock = %path.display(), error = %e, "could not remove lock file");
    }
}

#[cfg(not(unix))]
fn unlink_lock_file(_path: &Path) {}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ToolchainError::io("Failed to create lock directory", parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| ToolchainError::io("Failed to open lock file", path, e))
}

/// Whether `path` still names the file behind `file`. A previous holder may
/// have unlinked it while we waited, in which case the lock guards nothing.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> bool {
    true
}

/// `Ok(true)` if locked, `Ok(false)` if held elsewhere.
fn try_lock(file: &File, path: &Path) -> Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(err) if is_contended(&err) => Ok(false),
        Err(err) => Err(ToolchainError::io("Failed to lock", path, err)),
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}
