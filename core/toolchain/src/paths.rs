//! On-disk layout of the install root.
//!
//! ## Directory Structure
//!
//! ```text
//! <root>/
//!   compiler/                       # namespace
//!     linux/                        # platform
//!       x86_64/                     # arch: extracted payload
//!         bin/...
//!         .installed.json           # marker, written last
//!   compiler-linux-x86_64.lock      # per-target advisory lock
//!   .staging/
//!     compiler-linux-x86_64/        # per-target staging area
//!       <attempt>/                  # one temp dir per install attempt
//!   .cache/
//!     archives/                     # verified archive cache
//! ```
//!
//! The marker is the only signal that an install directory is ready to use.
//! It is written atomically after the payload has been moved into place, so a
//! reader that sees it can rely on the directory being complete.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ToolchainError};
use crate::target::Target;

/// Name of the marker file inside each install directory.
pub const MARKER_FILE: &str = ".installed.json";

/// Directory (under the root) holding per-target staging areas.
const STAGING_DIR: &str = ".staging";

/// Directory (under the root) holding cached archives.
const ARCHIVE_CACHE_DIR: &str = ".cache/archives";

/// Default directory name under the user's home directory.
#[cfg(not(windows))]
const DEFAULT_ROOT_DIR: &str = ".inference";

/// Subdirectory of the default root holding provisioned toolchains.
const DEFAULT_TOOLS_DIR: &str = "tools";

/// Contents of the installation marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRecord {
    /// The installed version, exactly as keyed in the platform manifest.
    pub version: String,
    /// SHA256 of the (whole) archive that was extracted.
    pub sha256: String,
    /// ISO 8601 timestamp of when the installation was committed.
    pub installed_at: String,
}

impl InstallRecord {
    /// Creates a record stamped with the current time.
    #[must_use = "returns a new record without side effects"]
    pub fn now(version: impl Into<String>, sha256: impl Into<String>) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        Self {
            version: version.into(),
            sha256: sha256.into(),
            installed_at: format_timestamp_iso8601(timestamp),
        }
    }

    /// Reads a marker file.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if the file cannot be read and
    /// [`ToolchainError::CorruptMarker`] if it is not a valid record.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)
            .map_err(|e| ToolchainError::io("Failed to read installation marker", path, e))?;
        serde_json::from_slice(&content).map_err(|source| ToolchainError::CorruptMarker {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the record to `path` atomically.
    ///
    /// The JSON is written to a temporary file in the same directory, flushed to
    /// disk and then renamed over `path`, so readers never observe a partial
    /// marker.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if any step fails.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let content = serde_json::to_vec_pretty(self).map_err(|e| {
            ToolchainError::io(
                "Failed to serialize installation marker",
                path,
                std::io::Error::other(e),
            )
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".marker-")
            .tempfile_in(dir)
            .map_err(|e| ToolchainError::io("Failed to create marker temp file", dir, e))?;
        tmp.write_all(&content)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| ToolchainError::io("Failed to write marker", tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| ToolchainError::io("Failed to commit marker", path, e.error))?;
        Ok(())
    }
}

/// Manages paths under one install root.
///
/// Cheap to clone; holds nothing but the root path.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    root: PathBuf,
}

impl InstallPaths {
    /// Creates a path manager rooted at an already-resolved directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<namespace>/<platform>/<arch>`
    #[must_use]
    pub fn install_dir(&self, target: &Target) -> PathBuf {
        self.root.join(target.relative_dir())
    }

    /// `<root>/<namespace>/<platform>/<arch>/.installed.json`
    #[must_use]
    pub fn marker_path(&self, target: &Target) -> PathBuf {
        self.install_dir(target).join(MARKER_FILE)
    }

    /// `<root>/<namespace>-<platform>-<arch>.lock`
    #[must_use]
    pub fn lock_path(&self, target: &Target) -> PathBuf {
        self.root.join(format!("{}.lock", target.slug()))
    }

    /// Per-target staging area. Lives on the same filesystem as the install
    /// directory so the final move is a rename.
    #[must_use]
    pub fn staging_dir(&self, target: &Target) -> PathBuf {
        self.root.join(STAGING_DIR).join(target.slug())
    }

    #[must_use]
    pub fn archive_cache_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_CACHE_DIR)
    }

    /// Returns `true` if the target's marker exists.
    #[must_use]
    pub fn is_installed(&self, target: &Target) -> bool {
        self.marker_path(target).is_file()
    }

    /// Creates the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if the directory cannot be created.
    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| ToolchainError::io("Failed to create install root", &self.root, e))
    }

    /// Lists every `(target, record)` whose marker exists under the root.
    ///
    /// Directories that do not form a valid target, or whose marker is missing,
    /// are skipped. Entries starting with `.` (staging, cache) are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read or a marker is corrupt.
    pub fn list_installed(&self) -> Result<Vec<(Target, InstallRecord)>> {
        let mut installed = Vec::new();
        if !self.root.is_dir() {
            return Ok(installed);
        }

        for namespace in visible_subdirs(&self.root)? {
            for platform in visible_subdirs(&self.root.join(&namespace))? {
                let platform_dir = self.root.join(&namespace).join(&platform);
                for arch in visible_subdirs(&platform_dir)? {
                    let Ok(target) = Target::new(namespace.clone(), platform.clone(), arch) else {
                        continue;
                    };
                    let marker = self.marker_path(&target);
                    if marker.is_file() {
                        let record = InstallRecord::read(&marker)?;
                        installed.push((target, record));
                    }
                }
            }
        }

        installed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(installed)
    }
}

/// Environment variable that overrides the Inference home directory.
pub const INFERENCE_HOME_ENV: &str = "INFERENCE_HOME";

/// Returns the default install root.
///
/// Priority:
/// 1. `$INFERENCE_HOME/tools` if the variable is set and non-empty
/// 2. `%APPDATA%\inference\tools` on Windows
/// 3. `~/.inference/tools` elsewhere
///
/// # Errors
///
/// Returns [`ToolchainError::Config`] if no home or data directory can be
/// determined.
pub fn default_root() -> Result<PathBuf> {
    if let Some(home) = std::env::var(INFERENCE_HOME_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
    {
        return Ok(PathBuf::from(home.trim()).join(DEFAULT_TOOLS_DIR));
    }

    #[cfg(windows)]
    let base = dirs::data_dir().map(|data| data.join("inference"));
    #[cfg(not(windows))]
    let base = dirs::home_dir().map(|home| home.join(DEFAULT_ROOT_DIR));

    base.map(|b| b.join(DEFAULT_TOOLS_DIR))
        .ok_or_else(|| ToolchainError::Config {
            message: "cannot determine home directory; set INFERENCE_HOME or configure a root"
                .to_string(),
        })
}

fn visible_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ToolchainError::io("Failed to read directory", dir, e))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ToolchainError::io("Failed to read directory entry", dir, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Formats a Unix timestamp as an ISO 8601 datetime string (YYYY-MM-DDTHH:MM:SSZ).
fn format_timestamp_iso8601(timestamp: u64) -> String {
    let days = timestamp / 86400;
    let secs_today = timestamp % 86400;
    let (year, month, day) = civil_from_days(days);

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        secs_today / 3600,
        (secs_today % 3600) / 60,
        secs_today % 60
    )
}

/// Converts days since the Unix epoch to a `(year, month, day)` civil date.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    let mut remaining = days;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining < days_in_year {
            break;
        }
        remaining -= days_in_year;
        year += 1;
    }

    let month_days: [u64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days_in_month in month_days {
        if remaining < days_in_month {
            break;
        }
        remaining -= days_in_month;
        month += 1;
    }

    (year, month, remaining + 1)
}

fn is_leap_year(year: u64) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}
