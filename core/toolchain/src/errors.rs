//! Error types for toolchain provisioning.
//!
//! [`ToolchainError`] is the low-level error every component returns. Each variant
//! carries enough context (URL, expected and actual hash, offending path) to
//! diagnose a failure without re-running verbosely. [`InstallError`] is what
//! [`Installer`](crate::Installer) hands back to callers: it names the target that
//! failed and keeps the root cause reachable through [`InstallError::cause`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::target::Target;

/// Result alias used throughout the crate.
pub type Result<T, E = ToolchainError> = std::result::Result<T, E>;

/// Consolidated error type for manifest resolution, download, verification,
/// extraction and locking.
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// Transport-level failure (DNS, connect, timeout, connection reset).
    ///
    /// Always considered transient.
    #[error("network error fetching {url}: {message}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server answered with a non-success status code.
    #[error("HTTP error {status}: {url}")]
    Http {
        /// The URL being fetched.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// A transient failure persisted through every retry attempt.
    #[error("download of {url} failed after {attempts} attempts")]
    Download {
        /// The URL being fetched.
        url: String,
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<ToolchainError>,
    },

    /// A ranged request was answered with something other than the range.
    ///
    /// Not transient: the server will not start honouring ranges on retry.
    #[error("server does not honour range requests for {url}")]
    RangeUnsupported {
        /// The URL being fetched.
        url: String,
    },

    /// Integrity check failed for a part or a whole archive.
    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// What was verified (a path, or a part label with its URL).
        subject: String,
        /// The expected SHA256 hex digest.
        expected: String,
        /// The computed SHA256 hex digest.
        actual: String,
    },

    /// A part's length differs from the size declared in the manifest.
    #[error("size mismatch for {subject}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// What was measured.
        subject: String,
        /// Declared size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    /// The root manifest does not describe the requested platform/arch.
    #[error("no {namespace} manifest for {platform}/{arch}")]
    UnsupportedTarget {
        /// Namespace that was looked up.
        namespace: String,
        /// Requested platform.
        platform: String,
        /// Requested architecture.
        arch: String,
    },

    /// The platform manifest has no entry for the requested version.
    #[error("version {requested} not found in manifest (available: {available})")]
    VersionNotFound {
        /// The version that was requested.
        requested: String,
        /// Comma-separated list of versions the manifest does offer.
        available: String,
    },

    /// A different version already occupies the target's install path.
    #[error("{target} has version {installed} installed; purge it before installing {requested}")]
    VersionConflict {
        /// The target in question.
        target: String,
        /// The version recorded in the marker.
        installed: String,
        /// The version that was requested.
        requested: String,
    },

    /// A manifest body is not valid JSON of the expected shape.
    #[error("failed to parse manifest from {url}")]
    ManifestParse {
        /// Where the manifest was fetched from.
        url: String,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A manifest parsed but contains an unusable value.
    #[error("invalid manifest {url}: {message}")]
    InvalidManifest {
        /// Where the manifest was fetched from.
        url: String,
        /// What is wrong with it.
        message: String,
    },

    /// The archive is malformed or contains an entry violating the extraction policy.
    #[error("extraction failed for {}: {reason}", path.display())]
    Extraction {
        /// The offending entry path, or the archive path for malformed archives.
        path: PathBuf,
        /// Why extraction was refused.
        reason: String,
    },

    /// The extracted tree failed a pre-commit check: a required file is
    /// missing or a custom payload check refused it.
    #[error("installation verification failed for {}: {reason}", path.display())]
    VerificationFailed {
        /// The checked path, relative to the install directory.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Bounded lock waiting was configured and the lock stayed held.
    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout {
        /// The lock file.
        path: PathBuf,
        /// How long we waited.
        waited: Duration,
    },

    /// A target component is empty or would escape the install root.
    #[error("invalid target component {value:?}: {reason}")]
    InvalidTarget {
        /// The rejected component.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The installation marker exists but cannot be decoded.
    #[error("corrupt installation marker: {}", path.display())]
    CorruptMarker {
        /// The marker file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration could not be loaded.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Filesystem operation failed.
    #[error("{message}: {}", path.display())]
    Io {
        /// Description of the operation that failed.
        message: String,
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ToolchainError {
    /// Creates a new `Network` error.
    #[must_use]
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new `Network` error with a source error.
    #[must_use]
    pub fn network_with_source(
        url: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            url: url.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new `ChecksumMismatch` error.
    #[must_use]
    pub fn checksum_mismatch(
        subject: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            subject: subject.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a new `Extraction` error.
    #[must_use]
    pub fn extraction(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Extraction {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `VerificationFailed` error.
    #[must_use]
    pub fn verification_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidTarget` error.
    #[must_use]
    pub fn invalid_target(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `Io` error with a description of the failed operation.
    #[must_use]
    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Network faults, server errors (5xx), throttling (429) and request
    /// timeouts (408) are transient. Integrity and manifest failures never are.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// Returns `true` for integrity failures (hash or size mismatch).
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::SizeMismatch { .. })
    }
}

/// Error returned by [`Installer`](crate::Installer) operations.
///
/// Wraps the root cause with the target that failed. A failed install never
/// leaves a marker or a populated install directory behind, so the call can be
/// retried as is.
#[derive(Debug, Error)]
#[error("failed to install {target}")]
pub struct InstallError {
    target: Target,
    #[source]
    cause: ToolchainError,
}

impl InstallError {
    /// Creates a new `InstallError` for `target`.
    #[must_use]
    pub fn new(target: Target, cause: ToolchainError) -> Self {
        Self { target, cause }
    }

    /// The target whose installation failed.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The underlying failure.
    #[must_use]
    pub fn cause(&self) -> &ToolchainError {
        &self.cause
    }

    /// Consumes the error, returning the underlying failure.
    #[must_use]
    pub fn into_cause(self) -> ToolchainError {
        self.cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_mismatch_displays_both_values() {
        let err = ToolchainError::checksum_mismatch("archive.tar.zst", "abc123", "def456");
        assert_eq!(
            err.to_string(),
            "checksum mismatch for archive.tar.zst: expected abc123, got def456"
        );
    }

    #[test]
    fn http_error_displays_status_and_url() {
        let err = ToolchainError::Http {
            url: "https://example.com/a.pkg".to_string(),
            status: 404,
        };
        assert_eq!(err.to_string(), "HTTP error 404: https://example.com/a.pkg");
    }

    #[test]
    fn extraction_error_displays_path_and_reason() {
        let err = ToolchainError::extraction("../../escape", "path escapes the target directory");
        assert_eq!(
            err.to_string(),
            "extraction failed for ../../escape: path escapes the target directory"
        );
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [500, 502, 503, 429, 408] {
            let err = ToolchainError::Http {
                url: "u".to_string(),
                status,
            };
            assert!(err.is_transient(), "status {status} should be transient");
        }
        assert!(ToolchainError::network("u", "connection reset").is_transient());
    }

    #[test]
    fn client_errors_and_integrity_failures_are_not_transient() {
        let not_found = ToolchainError::Http {
            url: "u".to_string(),
            status: 404,
        };
        assert!(!not_found.is_transient());

        let mismatch = ToolchainError::checksum_mismatch("a", "b", "c");
        assert!(!mismatch.is_transient());
        assert!(mismatch.is_integrity_failure());

        let ignored_range = ToolchainError::RangeUnsupported {
            url: "u".to_string(),
        };
        assert!(!ignored_range.is_transient());
        assert!(!ToolchainError::verification_failed("bin/clang", "missing").is_transient());
    }

    #[test]
    fn install_error_exposes_cause_and_source() {
        let target = Target::new("compiler", "linux", "x86_64").expect("Should build target");
        let err = InstallError::new(target, ToolchainError::checksum_mismatch("a", "b", "c"));

        assert_eq!(err.to_string(), "failed to install compiler/linux/x86_64");
        assert!(matches!(err.cause(), ToolchainError::ChecksumMismatch { .. }));

        let source = std::error::Error::source(&err).expect("Should expose source");
        assert!(source.to_string().starts_with("checksum mismatch"));
    }
}
