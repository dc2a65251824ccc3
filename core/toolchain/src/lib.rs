#![warn(clippy::pedantic)]

//! Toolchain provisioning for Inference.
//!
//! Downloads toolchain artifacts (compiler, sysroot, SDK, analyzer, ...)
//! described by remote JSON manifests, verifies them with SHA256, extracts them
//! into a per-target directory and commits the result with a marker file. Many
//! threads or processes may ask for the same target at once; exactly one of
//! them does the work and the rest reuse it.
//!
//! ```no_run
//! use inference_toolchain::{Installer, InstallerConfig, Target};
//!
//! let installer = Installer::new(&InstallerConfig::from_env())?;
//! let target = Target::new("compiler", "linux", "x86_64")?;
//! let dir = installer.ensure_installed(&target, "latest")?;
//! println!("compiler at {}", dir.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Module Structure
//!
//! - [`manifest`] - Root and platform manifest parsing and version resolution
//! - [`download`] - Streaming, retrying archive downloads (single, ranged and multi-part)
//! - [`verify`] - SHA256 checksum verification
//! - [`archive`] - Safe tar.zst, tar.gz, tar and zip extraction
//! - [`installer`] - Lock, staging and marker commit protocol
//! - [`cache`] - Verified archive cache
//! - [`lock`] - Per-target advisory file locks
//! - [`paths`] - Install root layout and markers
//! - [`transport`] - HTTP abstraction
//! - [`retry`] - Backoff policy for transient failures
//! - [`config`] - Installer settings
//! - [`logging`] - `tracing` subscriber setup

pub mod archive;
pub mod cache;
pub mod config;
pub mod download;
pub mod errors;
pub mod installer;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod paths;
pub mod permissions;
pub mod retry;
pub mod target;
pub mod transport;
pub mod verify;

pub use archive::{ArchiveFormat, detect_format, extract_archive};
pub use cache::ArchiveCache;
pub use config::InstallerConfig;
pub use download::{ArchiveFetcher, ParallelDownload, ProgressCallback, ProgressEvent};
pub use errors::{InstallError, Result, ToolchainError};
pub use installer::{Installer, PayloadCheck};
pub use lock::InstallLock;
pub use logging::init_logging;
pub use manifest::{
    ArchivePart, ArchiveSpec, ManifestResolver, PlatformManifest, RootManifest, VersionRequest,
    resolve_version,
};
pub use paths::{InstallPaths, InstallRecord, default_root};
pub use permissions::set_executable_permissions;
pub use retry::RetryPolicy;
pub use target::Target;
pub use transport::{HttpTransport, RemoteInfo, Transport};
pub use verify::{compute_sha256, verify_checksum};
