//! Archive downloads.
//!
//! This module streams archives to disk, verifying them as they arrive.
//!
//! ## Features
//!
//! - Streaming downloads in fixed-size chunks, hashed on the fly
//! - Retry of transient failures through [`RetryPolicy`]
//! - Each attempt writes `<dest>.partial`, renamed into place on success
//! - Multi-part archives: every part verified on arrival, then concatenated in
//!   listed order and verified as a whole
//! - Ranged parallel downloads of large single-file archives when the server
//!   advertises `Accept-Ranges: bytes`, falling back to one stream otherwise
//! - Optional progress callback

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::errors::{Result, ToolchainError};
use crate::manifest::{ArchivePart, ArchiveSpec};
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::verify::{check_digest, compute_sha256};

/// File name of the fetched archive inside the work directory.
pub const ARCHIVE_FILE: &str = "archive";

/// Suffix of in-flight downloads.
const PARTIAL_SUFFIX: &str = ".partial";

/// Copy buffer size.
const BUFFER_SIZE: usize = 64 * 1024;

/// Default size of one ranged request.
const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default number of concurrent ranged requests.
const DEFAULT_MAX_WORKERS: usize = 6;

/// Archives smaller than this are always fetched with one stream.
const DEFAULT_MIN_PARALLEL_SIZE: u64 = 10 * 1024 * 1024;

/// Settings for ranged parallel downloads of single-file archives.
///
/// Used only when the server answers a HEAD request with a length and
/// `Accept-Ranges: bytes`. The assembled file is verified against the same
/// whole-archive hash as a single-stream download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelDownload {
    /// Try ranged downloads at all.
    pub enabled: bool,
    /// Bytes per ranged request.
    pub chunk_size: u64,
    /// Upper bound on concurrent requests.
    pub max_workers: usize,
    /// Minimum archive size for a ranged download, in bytes.
    pub min_size: u64,
}

impl Default for ParallelDownload {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            min_size: DEFAULT_MIN_PARALLEL_SIZE,
        }
    }
}

impl ParallelDownload {
    /// Always download with a single stream.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Progress event emitted during downloads.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A download attempt has started.
    Started {
        /// The URL being downloaded.
        url: String,
    },
    /// Download progress update.
    Progress {
        /// The URL being downloaded.
        url: String,
        /// Bytes received so far in this attempt.
        downloaded: u64,
    },
    /// Download completed successfully.
    Completed {
        /// The URL that was downloaded.
        url: String,
        /// Total bytes received.
        bytes: u64,
    },
    /// Download failed for good.
    Failed {
        /// The URL being downloaded.
        url: String,
        /// Error description.
        error: String,
    },
}

/// Callback type for receiving progress updates during downloads.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// What one completed download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Streamed {
    bytes: u64,
    sha256: String,
}

/// Downloads and verifies archives described by an [`ArchiveSpec`].
#[derive(Clone)]
pub struct ArchiveFetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    parallel: ParallelDownload,
    progress: Option<ProgressCallback>,
}

impl ArchiveFetcher {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            parallel: ParallelDownload::default(),
            progress: None,
        }
    }

    /// Replaces the ranged download settings.
    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelDownload) -> Self {
        self.parallel = parallel;
        self
    }

    /// Reports download progress to `callback`.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Fetches the archive described by `spec` into `work_dir` and verifies it.
    ///
    /// Returns the path of the verified archive. Nothing is left at that path
    /// if verification fails.
    ///
    /// # Errors
    ///
    /// Returns network errors after retries, [`ToolchainError::ChecksumMismatch`]
    /// or [`ToolchainError::SizeMismatch`] on integrity failures, and
    /// [`ToolchainError::Io`] on local filesystem failures.
    pub fn fetch(&self, spec: &ArchiveSpec, work_dir: &Path) -> Result<PathBuf> {
        let dest = work_dir.join(ARCHIVE_FILE);
        match spec {
            ArchiveSpec::Single { href, sha256 } => {
                let streamed = self.download_archive(href, &dest)?;
                if let Err(e) = check_digest(href.as_str(), sha256, &streamed.sha256) {
                    let _ = std::fs::remove_file(&dest);
                    return Err(e);
                }
                Ok(dest)
            }
            ArchiveSpec::MultiPart {
                parts,
                whole_sha256,
            } => self.fetch_multi_part(parts, whole_sha256, &dest),
        }
    }

    /// Downloads `href` to `dest` without verifying it.
    ///
    /// # Errors
    ///
    /// Returns network errors after retries and [`ToolchainError::Io`] on
    /// local filesystem failures.
    pub fn fetch_single(&self, href: &Url, dest: &Path) -> Result<PathBuf> {
        self.download(href, dest)?;
        Ok(dest.to_path_buf())
    }

    /// Downloads every part, verifying each one as soon as it arrives, then
    /// concatenates them in listed order into `dest` and verifies the result
    /// against `whole_sha256`.
    ///
    /// The first failing part aborts the whole operation; later parts are not
    /// fetched and nothing is concatenated.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::SizeMismatch`] or
    /// [`ToolchainError::ChecksumMismatch`] for a bad part or whole archive,
    /// plus network and I/O errors.
    pub fn fetch_multi_part(
        &self,
        parts: &[ArchivePart],
        whole_sha256: &str,
        dest: &Path,
    ) -> Result<PathBuf> {
        let dir = parent_dir(dest);
        ensure_dir(dir)?;
        let parts_dir = tempfile::Builder::new()
            .prefix(".parts-")
            .tempdir_in(dir)
            .map_err(|e| ToolchainError::io("Failed to create parts directory", dir, e))?;

        let total = parts.len();
        let mut part_paths = Vec::with_capacity(total);
        for (index, part) in parts.iter().enumerate() {
            let label = format!("part {}/{total} ({})", index + 1, part.href);
            let path = parts_dir.path().join(format!("part{:04}", index + 1));

            let streamed = self.download(&part.href, &path)?;
            if let Some(expected) = part.size
                && streamed.bytes != expected
            {
                tracing::error!(part = %label, expected, actual = streamed.bytes, "size mismatch");
                return Err(ToolchainError::SizeMismatch {
                    subject: label,
                    expected,
                    actual: streamed.bytes,
                });
            }
            check_digest(&label, &part.sha256, &streamed.sha256)?;
            part_paths.push(path);
        }

        tracing::debug!(parts = total, dest = %dest.display(), "concatenating parts");
        let verified = concatenate(&part_paths, dest)
            .and_then(|actual| check_digest(&dest.display().to_string(), whole_sha256, &actual));
        if let Err(e) = verified {
            let _ = std::fs::remove_file(dest);
            return Err(e);
        }
        Ok(dest.to_path_buf())
    }

    /// Downloads a single-file archive, in ranges if the server allows it.
    ///
    /// A ranged download that fails in transfer falls back to one stream. Its
    /// result is hashed like any other download, so an integrity failure is
    /// reported by the caller, not retried here.
    fn download_archive(&self, url: &Url, dest: &Path) -> Result<Streamed> {
        if let Some(length) = self.ranged_length(url) {
            match self.download_ranged(url, dest, length) {
                Ok(streamed) => return Ok(streamed),
                Err(e) => {
                    tracing::warn!(%url, error = %e, "ranged download failed, using a single stream");
                }
            }
        }
        self.download(url, dest)
    }

    /// The remote length of `url` if it should be fetched in ranges.
    fn ranged_length(&self, url: &Url) -> Option<u64> {
        if !self.parallel.enabled {
            return None;
        }
        let info = match self.transport.head(url) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(%url, error = %e, "HEAD failed, using a single stream");
                return None;
            }
        };
        match info.length {
            Some(length) if info.accepts_ranges && length > 0 && length >= self.parallel.min_size => {
                Some(length)
            }
            length => {
                tracing::debug!(%url, ?length, ranges = info.accepts_ranges, "using a single stream");
                None
            }
        }
    }

    /// Fetches `length` bytes of `url` as concurrent ranged requests written
    /// in place into `<dest>.partial`, then hashes the result.
    fn download_ranged(&self, url: &Url, dest: &Path, length: u64) -> Result<Streamed> {
        ensure_dir(parent_dir(dest))?;
        let partial = partial_path(dest);
        let result = self.fill_ranged(url, &partial, length);
        let streamed = match result {
            Ok(streamed) => streamed,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };

        std::fs::rename(&partial, dest).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            ToolchainError::io("Failed to move download into place", dest, e)
        })?;

        tracing::info!(%url, bytes = streamed.bytes, "downloaded in ranges");
        self.emit(|| ProgressEvent::Completed {
            url: url.to_string(),
            bytes: streamed.bytes,
        });
        Ok(streamed)
    }

    fn fill_ranged(&self, url: &Url, partial: &Path, length: u64) -> Result<Streamed> {
        let file = File::create(partial)
            .map_err(|e| ToolchainError::io("Failed to create download file", partial, e))?;
        file.set_len(length)
            .map_err(|e| ToolchainError::io("Failed to size download file", partial, e))?;

        let ranges = chunk_ranges(length, self.parallel.chunk_size);
        let workers = self.parallel.max_workers.clamp(1, ranges.len().max(1));
        tracing::debug!(%url, length, chunks = ranges.len(), workers, "ranged download");
        self.emit(|| ProgressEvent::Started {
            url: url.to_string(),
        });

        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let downloaded = AtomicU64::new(0);
        let work = || -> Result<()> {
            while !failed.load(Ordering::SeqCst) {
                let Some(&(start, end)) = ranges.get(next.fetch_add(1, Ordering::SeqCst)) else {
                    break;
                };
                let fetched = self.policy.run(url.as_str(), |attempt| {
                    tracing::trace!(%url, start, end, attempt, "range attempt");
                    self.fetch_range(url, &file, partial, (start, end), &downloaded)
                });
                if let Err(e) = fetched {
                    failed.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
            Ok(())
        };

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers).map(|_| scope.spawn(&work)).collect();
            let mut first_error = None;
            for handle in handles {
                let outcome = handle.join().unwrap_or_else(|_| {
                    Err(ToolchainError::network(url.as_str(), "download worker panicked"))
                });
                if let Err(e) = outcome {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })?;

        file.sync_all()
            .map_err(|e| ToolchainError::io("Failed to flush download", partial, e))?;
        Ok(Streamed {
            bytes: length,
            sha256: compute_sha256(partial)?,
        })
    }

    /// One attempt at the inclusive byte range `start..=end`.
    fn fetch_range(
        &self,
        url: &Url,
        file: &File,
        path: &Path,
        (start, end): (u64, u64),
        downloaded: &AtomicU64,
    ) -> Result<()> {
        let mut body = self.transport.get_range(url, start, end)?;
        let expected = end - start + 1;
        let mut received: u64 = 0;
        let mut buffer = vec![0u8; BUFFER_SIZE];

        let outcome = loop {
            let n = match body.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(ToolchainError::network_with_source(url.as_str(), e)),
            };
            if received + n as u64 > expected {
                break Err(ToolchainError::RangeUnsupported {
                    url: url.to_string(),
                });
            }
            if let Err(e) = write_at(file, &buffer[..n], start + received) {
                break Err(ToolchainError::io("Failed to write download", path, e));
            }
            received += n as u64;
            let total = downloaded.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
            self.emit(|| ProgressEvent::Progress {
                url: url.to_string(),
                downloaded: total,
            });
        };

        let outcome = outcome.and_then(|()| {
            if received == expected {
                Ok(())
            } else {
                Err(ToolchainError::network(
                    url.as_str(),
                    format!("range {start}-{end} ended after {received} of {expected} bytes"),
                ))
            }
        });
        if outcome.is_err() {
            // The retry rewrites this range from the start.
            downloaded.fetch_sub(received, Ordering::SeqCst);
        }
        outcome
    }

    /// Downloads `url` to `dest` with retries, via `<dest>.partial`.
    fn download(&self, url: &Url, dest: &Path) -> Result<Streamed> {
        ensure_dir(parent_dir(dest))?;
        let partial = partial_path(dest);

        let result = self.policy.run(url.as_str(), |attempt| {
            tracing::debug!(%url, attempt, "download attempt");
            self.emit(|| ProgressEvent::Started {
                url: url.to_string(),
            });
            let streamed = self.stream_once(url, &partial);
            if streamed.is_err() {
                let _ = std::fs::remove_file(&partial);
            }
            streamed
        });

        let streamed = match result {
            Ok(streamed) => streamed,
            Err(e) => {
                self.emit(|| ProgressEvent::Failed {
                    url: url.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        std::fs::rename(&partial, dest).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            ToolchainError::io("Failed to move download into place", dest, e)
        })?;

        tracing::info!(%url, bytes = streamed.bytes, "downloaded");
        self.emit(|| ProgressEvent::Completed {
            url: url.to_string(),
            bytes: streamed.bytes,
        });
        Ok(streamed)
    }

    /// One attempt: streams the body into `path`, hashing as it goes.
    fn stream_once(&self, url: &Url, path: &Path) -> Result<Streamed> {
        let mut body = self.transport.get(url)?;
        let mut file = File::create(path)
            .map_err(|e| ToolchainError::io("Failed to create download file", path, e))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut downloaded: u64 = 0;

        loop {
            let n = match body.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ToolchainError::network_with_source(url.as_str(), e)),
            };
            file.write_all(&buffer[..n])
                .map_err(|e| ToolchainError::io("Failed to write download", path, e))?;
            hasher.update(&buffer[..n]);
            downloaded += n as u64;
            self.emit(|| ProgressEvent::Progress {
                url: url.to_string(),
                downloaded,
            });
        }

        file.sync_all()
            .map_err(|e| ToolchainError::io("Failed to flush download", path, e))?;

        Ok(Streamed {
            bytes: downloaded,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    fn emit(&self, event: impl FnOnce() -> ProgressEvent) {
        if let Some(callback) = &self.progress {
            callback(event());
        }
    }
}

impl std::fmt::Debug for ArchiveFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFetcher")
            .field("policy", &self.policy)
            .field("parallel", &self.parallel)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

/// Concatenates `parts` in order into `dest`, returning the SHA256 of the
/// result.
fn concatenate(parts: &[PathBuf], dest: &Path) -> Result<String> {
    let mut out = File::create(dest)
        .map_err(|e| ToolchainError::io("Failed to create archive file", dest, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    for part in parts {
        let mut input = File::open(part)
            .map_err(|e| ToolchainError::io("Failed to open archive part", part, e))?;
        loop {
            let n = input
                .read(&mut buffer)
                .map_err(|e| ToolchainError::io("Failed to read archive part", part, e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .map_err(|e| ToolchainError::io("Failed to write archive file", dest, e))?;
            hasher.update(&buffer[..n]);
        }
    }

    out.sync_all()
        .map_err(|e| ToolchainError::io("Failed to flush archive file", dest, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Splits `length` bytes into inclusive `(start, end)` ranges of at most
/// `chunk_size` bytes.
fn chunk_ranges(length: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < length {
        let end = (start + chunk_size - 1).min(length - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| ToolchainError::io("Failed to create directory", dir, e))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::transport::Body;
    use crate::verify::sha256_hex;

    /// Serves fixed bodies; the first `flaky` requests of each URL break
    /// mid-stream.
    #[derive(Default)]
    struct FakeTransport {
        bodies: HashMap<String, Vec<u8>>,
        flaky: u32,
        hits: Mutex<HashMap<String, u32>>,
        total: AtomicU32,
    }

    impl FakeTransport {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.bodies.insert(url.to_string(), body.to_vec());
            self
        }

        fn hits(&self, url: &str) -> u32 {
            self.hits
                .lock()
                .expect("Should lock")
                .get(url)
                .copied()
                .unwrap_or(0)
        }
    }

    struct BrokenBody(Cursor<Vec<u8>>);

    impl Read for BrokenBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.0.read(buf)?;
            if n == 0 {
                Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset"))
            } else {
                Ok(n)
            }
        }
    }

    impl Transport for FakeTransport {
        fn get(&self, url: &Url) -> Result<Body> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let hit = {
                let mut hits = self.hits.lock().expect("Should lock");
                let hit = hits.entry(url.to_string()).or_insert(0);
                *hit += 1;
                *hit
            };
            let Some(body) = self.bodies.get(url.as_str()) else {
                return Err(ToolchainError::Http {
                    url: url.to_string(),
                    status: 404,
                });
            };
            if hit <= self.flaky {
                let half = body[..body.len() / 2].to_vec();
                return Ok(Box::new(BrokenBody(Cursor::new(half))));
            }
            Ok(Box::new(Cursor::new(body.clone())))
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).expect("Should parse URL")
    }

    fn fetcher(transport: FakeTransport) -> (ArchiveFetcher, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let fetcher = ArchiveFetcher::new(transport.clone(), RetryPolicy::fixed(3, Duration::ZERO));
        (fetcher, transport)
    }

    fn part(href: &str, body: &[u8]) -> ArchivePart {
        ArchivePart {
            href: url(href),
            sha256: sha256_hex(body),
            size: None,
        }
    }

    const P1: &[u8] = b"first part|";
    const P2: &[u8] = b"second part|";
    const P3: &[u8] = b"third part";

    fn three_parts() -> FakeTransport {
        FakeTransport::default()
            .with("https://h/a.part1", P1)
            .with("https://h/a.part2", P2)
            .with("https://h/a.part3", P3)
    }

    fn whole() -> Vec<u8> {
        [P1, P2, P3].concat()
    }

    #[test]
    fn fetch_single_archive_verifies_and_keeps_file() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let body = b"archive bytes";
        let (fetcher, transport) = fetcher(FakeTransport::default().with("https://h/a.pkg", body));

        let spec = ArchiveSpec::Single {
            href: url("https://h/a.pkg"),
            sha256: sha256_hex(body),
        };
        let path = fetcher.fetch(&spec, dir.path()).expect("Should fetch");

        assert_eq!(std::fs::read(&path).expect("Should read"), body);
        assert_eq!(transport.hits("https://h/a.pkg"), 1);
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn tampered_single_archive_is_rejected_and_removed() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, _) = fetcher(FakeTransport::default().with("https://h/a.pkg", b"tampered"));

        let spec = ArchiveSpec::Single {
            href: url("https://h/a.pkg"),
            sha256: sha256_hex(b"original"),
        };
        let err = fetcher.fetch(&spec, dir.path()).unwrap_err();

        assert!(matches!(err, ToolchainError::ChecksumMismatch { .. }));
        assert!(!dir.path().join(ARCHIVE_FILE).exists());
    }

    #[test]
    fn checksum_mismatch_is_not_retried() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, transport) = fetcher(FakeTransport::default().with("https://h/a.pkg", b"x"));

        let spec = ArchiveSpec::Single {
            href: url("https://h/a.pkg"),
            sha256: sha256_hex(b"y"),
        };
        assert!(fetcher.fetch(&spec, dir.path()).is_err());
        assert_eq!(transport.hits("https://h/a.pkg"), 1);
    }

    #[test]
    fn mid_stream_failure_is_retried() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let body = b"a body long enough to be cut in half";
        let mut transport = FakeTransport::default().with("https://h/a.pkg", body);
        transport.flaky = 2;
        let (fetcher, transport) = fetcher(transport);

        let path = fetcher
            .fetch_single(&url("https://h/a.pkg"), &dir.path().join("a.pkg"))
            .expect("Should succeed on third attempt");

        assert_eq!(std::fs::read(path).expect("Should read"), body);
        assert_eq!(transport.hits("https://h/a.pkg"), 3);
    }

    #[test]
    fn exhausted_retries_report_download_error() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let mut transport = FakeTransport::default().with("https://h/a.pkg", b"0123456789");
        transport.flaky = u32::MAX;
        let (fetcher, transport) = fetcher(transport);

        let dest = dir.path().join("a.pkg");
        let err = fetcher.fetch_single(&url("https://h/a.pkg"), &dest).unwrap_err();

        assert!(matches!(err, ToolchainError::Download { attempts: 3, .. }));
        assert_eq!(transport.hits("https://h/a.pkg"), 3);
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn not_found_fails_immediately() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, transport) = fetcher(FakeTransport::default());

        let err = fetcher
            .fetch_single(&url("https://h/missing"), &dir.path().join("x"))
            .unwrap_err();

        assert!(matches!(err, ToolchainError::Http { status: 404, .. }));
        assert_eq!(transport.hits("https://h/missing"), 1);
    }

    #[test]
    fn multi_part_concatenates_in_listed_order() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, _) = fetcher(three_parts());

        let parts = [
            part("https://h/a.part1", P1),
            part("https://h/a.part2", P2),
            part("https://h/a.part3", P3),
        ];
        let dest = dir.path().join("archive");
        fetcher
            .fetch_multi_part(&parts, &sha256_hex(&whole()), &dest)
            .expect("Should fetch");

        assert_eq!(std::fs::read(&dest).expect("Should read"), whole());
    }

    #[test]
    fn permuted_parts_fail_whole_archive_verification() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, _) = fetcher(three_parts());

        let parts = [
            part("https://h/a.part2", P2),
            part("https://h/a.part1", P1),
            part("https://h/a.part3", P3),
        ];
        let dest = dir.path().join("archive");
        let err = fetcher
            .fetch_multi_part(&parts, &sha256_hex(&whole()), &dest)
            .unwrap_err();

        assert!(matches!(err, ToolchainError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn tampered_part_aborts_before_later_parts() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, transport) = fetcher(three_parts());

        let mut bad = part("https://h/a.part2", P2);
        bad.sha256 = sha256_hex(b"something else");
        let parts = [part("https://h/a.part1", P1), bad, part("https://h/a.part3", P3)];
        let dest = dir.path().join("archive");

        let err = fetcher
            .fetch_multi_part(&parts, &sha256_hex(&whole()), &dest)
            .unwrap_err();

        match err {
            ToolchainError::ChecksumMismatch { subject, .. } => {
                assert!(subject.starts_with("part 2/3"), "unexpected subject {subject}");
            }
            other => panic!("Expected ChecksumMismatch, got {other:?}"),
        }
        assert_eq!(transport.hits("https://h/a.part3"), 0);
        assert!(!dest.exists());
    }

    #[test]
    fn part_size_mismatch_is_fatal() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, _) = fetcher(three_parts());

        let mut first = part("https://h/a.part1", P1);
        first.size = Some(P1.len() as u64 + 1);
        let parts = [first, part("https://h/a.part2", P2), part("https://h/a.part3", P3)];

        let err = fetcher
            .fetch_multi_part(&parts, &sha256_hex(&whole()), &dir.path().join("archive"))
            .unwrap_err();

        assert!(matches!(err, ToolchainError::SizeMismatch { .. }));
    }

    #[test]
    fn temporary_part_files_are_cleaned_up() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let (fetcher, _) = fetcher(three_parts());

        let parts = [
            part("https://h/a.part1", P1),
            part("https://h/a.part2", P2),
            part("https://h/a.part3", P3),
        ];
        fetcher
            .fetch(
                &ArchiveSpec::MultiPart {
                    parts: parts.to_vec(),
                    whole_sha256: sha256_hex(&whole()),
                },
                dir.path(),
            )
            .expect("Should fetch");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("Should list")
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers, [std::ffi::OsString::from(ARCHIVE_FILE)]);
    }

    #[test]
    fn progress_events_are_reported() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let (fetcher, _) = fetcher(FakeTransport::default().with("https://h/a.pkg", b"abc"));
        let fetcher = fetcher.with_progress(Arc::new(move |event: ProgressEvent| {
            sink.lock().expect("Should lock").push(event);
        }));

        fetcher
            .fetch_single(&url("https://h/a.pkg"), &dir.path().join("a.pkg"))
            .expect("Should fetch");

        let events = events.lock().expect("Should lock");
        assert!(matches!(events.first(), Some(ProgressEvent::Started { .. })));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Completed { bytes: 3, .. })
        ));
    }

    #[test]
    fn chunk_ranges_cover_length_exactly() {
        assert_eq!(chunk_ranges(10, 4), [(0, 3), (4, 7), (8, 9)]);
        assert_eq!(chunk_ranges(8, 4), [(0, 3), (4, 7)]);
        assert_eq!(chunk_ranges(3, 8), [(0, 2)]);
        assert!(chunk_ranges(0, 8).is_empty());
    }

    /// Serves one body with HEAD and range support; `honour_ranges: false`
    /// answers ranged requests like a server that sends the whole file.
    struct RangedTransport {
        body: Vec<u8>,
        honour_ranges: bool,
        range_requests: AtomicU32,
        plain_requests: AtomicU32,
    }

    impl RangedTransport {
        fn new(body: &[u8], honour_ranges: bool) -> Self {
            Self {
                body: body.to_vec(),
                honour_ranges,
                range_requests: AtomicU32::new(0),
                plain_requests: AtomicU32::new(0),
            }
        }
    }

    impl Transport for RangedTransport {
        fn get(&self, _url: &Url) -> Result<Body> {
            self.plain_requests.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(self.body.clone())))
        }

        fn head(&self, _url: &Url) -> Result<Option<crate::transport::RemoteInfo>> {
            Ok(Some(crate::transport::RemoteInfo {
                length: Some(self.body.len() as u64),
                accepts_ranges: true,
            }))
        }

        fn get_range(&self, url: &Url, start: u64, end: u64) -> Result<Body> {
            self.range_requests.fetch_add(1, Ordering::SeqCst);
            if !self.honour_ranges {
                return Err(ToolchainError::RangeUnsupported {
                    url: url.to_string(),
                });
            }
            let range = usize::try_from(start).expect("Should fit")
                ..=usize::try_from(end).expect("Should fit");
            Ok(Box::new(Cursor::new(self.body[range].to_vec())))
        }
    }

    fn small_chunks() -> ParallelDownload {
        ParallelDownload {
            enabled: true,
            chunk_size: 7,
            max_workers: 3,
            min_size: 0,
        }
    }

    #[test]
    fn ranged_download_reassembles_in_place() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let body: Vec<u8> = (0..=200u8).collect();
        let transport = Arc::new(RangedTransport::new(&body, true));
        let fetcher = ArchiveFetcher::new(transport.clone(), RetryPolicy::fixed(2, Duration::ZERO))
            .with_parallel(small_chunks());

        let spec = ArchiveSpec::Single {
            href: url("https://h/big.pkg"),
            sha256: sha256_hex(&body),
        };
        let path = fetcher.fetch(&spec, dir.path()).expect("Should fetch");

        assert_eq!(std::fs::read(&path).expect("Should read"), body);
        assert_eq!(transport.range_requests.load(Ordering::SeqCst), 29);
        assert_eq!(transport.plain_requests.load(Ordering::SeqCst), 0);
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn ignored_ranges_fall_back_to_one_stream() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let body = b"served whole, never in ranges".to_vec();
        let transport = Arc::new(RangedTransport::new(&body, false));
        let fetcher = ArchiveFetcher::new(transport.clone(), RetryPolicy::fixed(3, Duration::ZERO))
            .with_parallel(small_chunks());

        let spec = ArchiveSpec::Single {
            href: url("https://h/a.pkg"),
            sha256: sha256_hex(&body),
        };
        let path = fetcher.fetch(&spec, dir.path()).expect("Should fetch");

        assert_eq!(std::fs::read(path).expect("Should read"), body);
        assert_eq!(transport.plain_requests.load(Ordering::SeqCst), 1);
        assert!(
            transport.range_requests.load(Ordering::SeqCst) >= 1,
            "a ranged attempt should come first"
        );
    }

    #[test]
    fn ranged_download_is_verified_against_whole_hash() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let body: Vec<u8> = (0..100u8).collect();
        let transport = Arc::new(RangedTransport::new(&body, true));
        let fetcher = ArchiveFetcher::new(transport.clone(), RetryPolicy::fixed(3, Duration::ZERO))
            .with_parallel(small_chunks());

        let spec = ArchiveSpec::Single {
            href: url("https://h/a.pkg"),
            sha256: sha256_hex(b"something else"),
        };
        let err = fetcher.fetch(&spec, dir.path()).unwrap_err();

        assert!(matches!(err, ToolchainError::ChecksumMismatch { .. }));
        assert_eq!(
            transport.plain_requests.load(Ordering::SeqCst),
            0,
            "integrity failures do not fall back"
        );
        assert!(!dir.path().join(ARCHIVE_FILE).exists());
    }

    #[test]
    fn small_or_disabled_downloads_use_one_stream() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let body = b"tiny".to_vec();
        let spec = ArchiveSpec::Single {
            href: url("https://h/a.pkg"),
            sha256: sha256_hex(&body),
        };

        let transport = Arc::new(RangedTransport::new(&body, true));
        let below_threshold = ParallelDownload {
            min_size: 1024,
            ..small_chunks()
        };
        ArchiveFetcher::new(transport.clone(), RetryPolicy::no_retry())
            .with_parallel(below_threshold)
            .fetch(&spec, dir.path())
            .expect("Should fetch");
        assert_eq!(transport.range_requests.load(Ordering::SeqCst), 0);

        let transport = Arc::new(RangedTransport::new(&body, true));
        ArchiveFetcher::new(transport.clone(), RetryPolicy::no_retry())
            .with_parallel(ParallelDownload::disabled())
            .fetch(&spec, dir.path())
            .expect("Should fetch");
        assert_eq!(transport.range_requests.load(Ordering::SeqCst), 0);
        assert_eq!(transport.plain_requests.load(Ordering::SeqCst), 1);
    }
}
