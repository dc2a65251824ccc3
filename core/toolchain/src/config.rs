//! Installer configuration.
//!
//! [`InstallerConfig`] can be built in code, deserialized from TOML or taken
//! from the environment. Every field has a default, so a TOML file only needs
//! the keys it changes:
//!
//! ```toml
//! root = "/opt/inference/tools"
//! manifest_base_url = "https://mirror.example.com/toolchains/"
//! lock_timeout_secs = 600
//!
//! [retry]
//! max_attempts = 5
//!
//! [parallel]
//! max_workers = 4
//!
//! [required_files]
//! compiler = ["bin/clang"]
//! ```

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::download::ParallelDownload;
use crate::errors::{Result, ToolchainError};
use crate::paths::default_root;
use crate::retry::RetryPolicy;
use crate::transport::{DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_USER_AGENT};

/// Environment variable to override the manifest server URL.
pub const DIST_SERVER_ENV: &str = "INFERENCE_DIST_SERVER";

/// Default location of the manifest tree.
pub const DEFAULT_MANIFEST_BASE_URL: &str = "https://inference-lang.org/toolchains/";

/// Settings for an [`Installer`](crate::Installer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Install root. `None` means [`default_root`].
    pub root: Option<PathBuf>,
    /// Base URL of the manifest tree; root manifests live at
    /// `<base>/<namespace>/manifest.json`.
    pub manifest_base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Retry policy for manifest and archive downloads.
    pub retry: RetryPolicy,
    /// Upper bound on waiting for another install of the same target.
    /// `None` waits indefinitely.
    pub lock_timeout_secs: Option<u64>,
    /// User-Agent header for HTTP requests.
    pub user_agent: String,
    /// Keep verified archives under `<root>/.cache/archives`.
    pub archive_cache: bool,
    /// Ranged parallel downloads of large single-file archives.
    pub parallel: ParallelDownload,
    /// Files that must exist in an extracted tree before it is committed,
    /// keyed by namespace and relative to the install directory.
    pub required_files: BTreeMap<String, Vec<PathBuf>>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            root: None,
            manifest_base_url: DEFAULT_MANIFEST_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
            lock_timeout_secs: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            archive_cache: true,
            parallel: ParallelDownload::default(),
            required_files: BTreeMap::new(),
        }
    }
}

impl InstallerConfig {
    /// Default configuration rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Default configuration with environment overrides applied.
    ///
    /// `INFERENCE_DIST_SERVER` replaces the manifest base URL. Empty or
    /// whitespace-only values are treated as unset. The install root honors
    /// `INFERENCE_HOME` through [`default_root`].
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(server) = std::env::var(DIST_SERVER_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            config.manifest_base_url = server.trim().to_string();
        }
        config
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Config`] for malformed TOML or unknown value
    /// types.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ToolchainError::Config {
            message: e.to_string(),
        })
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] if the file cannot be read and
    /// [`ToolchainError::Config`] if it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ToolchainError::io("Failed to read config file", path, e))?;
        Self::from_toml_str(&content)
    }

    /// The install root, falling back to [`default_root`].
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Config`] if no root is configured and the
    /// home directory cannot be determined.
    pub fn resolved_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => default_root(),
        }
    }

    /// The manifest base URL, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Config`] if it is not an absolute URL.
    pub fn manifest_base_url(&self) -> Result<Url> {
        Url::parse(self.manifest_base_url.trim()).map_err(|e| ToolchainError::Config {
            message: format!("invalid manifest_base_url {:?}: {e}", self.manifest_base_url),
        })
    }

    /// The required files of `namespace`, checked to be plain relative paths.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Config`] for an absolute path or one with
    /// `..` in it.
    pub fn required_files_for(&self, namespace: &str) -> Result<&[PathBuf]> {
        let files = self.required_files.get(namespace).map_or(&[][..], Vec::as_slice);
        if let Some(bad) = files.iter().find(|path| {
            path.as_os_str().is_empty()
                || !path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        }) {
            return Err(ToolchainError::Config {
                message: format!(
                    "required file {} of {namespace} must be a relative path inside the install directory",
                    bad.display()
                ),
            });
        }
        Ok(files)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }
}
