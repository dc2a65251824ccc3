//! Installation coordinator.
//!
//! [`Installer`] ties the other components together under the commit
//! protocol:
//!
//! 1. A present marker means installed. Return at once, no network.
//! 2. Otherwise take the per-target lock and check the marker again.
//! 3. Clear leftovers of abandoned attempts, resolve the manifest, fetch and
//!    verify the archive (or reuse a cached copy) and extract it into a fresh
//!    staging directory.
//! 4. Check the extracted tree: configured required files, then the optional
//!    [`PayloadCheck`].
//! 5. Rename staging into the install directory, then write the marker.
//!
//! Any failure before the marker write leaves neither a marker nor an install
//! directory behind, so the same call can simply be repeated. Staging areas
//! and the lock file are removed on every exit, successful or not.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::archive::extract_archive;
use crate::cache::ArchiveCache;
use crate::config::InstallerConfig;
use crate::download::{ArchiveFetcher, ProgressCallback};
use crate::errors::{InstallError, Result, ToolchainError};
use crate::lock::InstallLock;
use crate::manifest::{ArchiveSpec, ManifestResolver, VersionRequest};
use crate::paths::{InstallPaths, InstallRecord, MARKER_FILE};
use crate::target::Target;
use crate::transport::{HttpTransport, Transport};

/// Name of the extracted tree inside an attempt directory.
const PAYLOAD_DIR: &str = "payload";

/// Prefix of per-attempt directories under the staging area.
const ATTEMPT_PREFIX: &str = "attempt-";

/// How often a directory is re-created when a concurrent cleanup removes it
/// between creation and use.
const CREATE_RETRIES: u32 = 5;

/// Inspects an extracted tree before it is committed.
///
/// Receives the target and the extracted directory. An error aborts the
/// install with nothing committed; return
/// [`ToolchainError::VerificationFailed`] to name what was wrong.
pub type PayloadCheck = Arc<dyn Fn(&Target, &Path) -> Result<()> + Send + Sync>;

/// Installs toolchain artifacts into one install root.
///
/// `Installer` is `Send + Sync`; share it across threads with an [`Arc`].
/// Installs of different targets proceed in parallel. Installs of the same
/// target, from any thread or process using the same root, are serialized by
/// a file lock and only the first one does any work.
pub struct Installer {
    paths: InstallPaths,
    resolver: ManifestResolver,
    fetcher: ArchiveFetcher,
    cache: ArchiveCache,
    use_cache: bool,
    lock_timeout: Option<Duration>,
    required_files: BTreeMap<String, Vec<PathBuf>>,
    payload_check: Option<PayloadCheck>,
}

impl Installer {
    /// Creates an installer that talks HTTP(S) through `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Config`] for an unusable root or manifest URL
    /// and [`ToolchainError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &InstallerConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.request_timeout(), &config.user_agent)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates an installer on top of a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Config`] for an unusable root, manifest URL or
    /// required file path.
    pub fn with_transport(config: &InstallerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let paths = InstallPaths::new(config.resolved_root()?);
        let resolver =
            ManifestResolver::new(transport.clone(), config.retry, config.manifest_base_url()?);
        let fetcher = ArchiveFetcher::new(transport, config.retry).with_parallel(config.parallel);
        let cache = ArchiveCache::new(paths.archive_cache_dir());
        let mut required_files = BTreeMap::new();
        for namespace in config.required_files.keys() {
            let files = config.required_files_for(namespace)?;
            required_files.insert(namespace.clone(), files.to_vec());
        }

        tracing::debug!(
            root = %paths.root().display(),
            base = %resolver.base(),
            archive_cache = config.archive_cache,
            "installer configured"
        );

        Ok(Self {
            paths,
            resolver,
            fetcher,
            cache,
            use_cache: config.archive_cache,
            lock_timeout: config.lock_timeout(),
            required_files,
            payload_check: None,
        })
    }

    /// Reports download progress to `callback`.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.fetcher = self.fetcher.with_progress(callback);
        self
    }

    /// Runs `check` on every extracted tree before it is committed.
    #[must_use]
    pub fn with_payload_check(mut self, check: PayloadCheck) -> Self {
        self.payload_check = Some(check);
        self
    }

    #[must_use]
    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    /// Makes sure `target` is installed and returns its install directory.
    ///
    /// If the target is already installed this returns without touching the
    /// network. A specific version that differs from the installed one is an
    /// error; there is no in-place upgrade.
    ///
    /// # Arguments
    ///
    /// * `target` - What to install.
    /// * `version` - `"latest"`, a version string, or a [`VersionRequest`].
    ///
    /// # Errors
    ///
    /// Returns an [`InstallError`] wrapping the root cause:
    /// - [`ToolchainError::VersionConflict`] if another version is installed
    /// - [`ToolchainError::LockTimeout`] if the configured lock wait elapses
    /// - [`ToolchainError::UnsupportedTarget`] or
    ///   [`ToolchainError::VersionNotFound`] from manifest resolution
    /// - network, integrity and extraction errors from the pipeline
    pub fn ensure_installed(
        &self,
        target: &Target,
        version: impl Into<VersionRequest>,
    ) -> std::result::Result<PathBuf, InstallError> {
        let request = version.into();
        let _span =
            tracing::info_span!("ensure_installed", %target, version = %request).entered();

        self.ensure_installed_inner(target, &request)
            .map_err(|cause| {
                tracing::error!(error = %cause, "installation failed");
                InstallError::new(target.clone(), cause)
            })
    }

    fn ensure_installed_inner(&self, target: &Target, request: &VersionRequest) -> Result<PathBuf> {
        if let Some(dir) = self.check_installed(target, request)? {
            tracing::debug!(dir = %dir.display(), "already installed");
            return Ok(dir);
        }

        self.paths.ensure_root()?;
        let mut lock = InstallLock::acquire(&self.paths.lock_path(target), self.lock_timeout)?;
        lock.remove_on_release();

        // Another holder may have finished while we waited.
        if let Some(dir) = self.check_installed(target, request)? {
            tracing::debug!(dir = %dir.display(), "installed by a concurrent caller");
            return Ok(dir);
        }

        self.install_locked(target, request)
    }

    /// `Some(install_dir)` if the marker exists and satisfies `request`.
    fn check_installed(&self, target: &Target, request: &VersionRequest) -> Result<Option<PathBuf>> {
        let marker = self.paths.marker_path(target);
        if !marker.is_file() {
            return Ok(None);
        }

        if let VersionRequest::Exact(requested) = request {
            let record = InstallRecord::read(&marker)?;
            if record.version != *requested {
                return Err(ToolchainError::VersionConflict {
                    target: target.to_string(),
                    installed: record.version,
                    requested: requested.clone(),
                });
            }
        }

        Ok(Some(self.paths.install_dir(target)))
    }

    /// Runs the pipeline. The caller holds the target's lock and has seen no
    /// marker.
    fn install_locked(&self, target: &Target, request: &VersionRequest) -> Result<PathBuf> {
        let install_dir = self.paths.install_dir(target);
        let result = self.attempt_install(target, request, &install_dir);
        if result.is_err() {
            prune_empty_parents(&install_dir, self.paths.root());
        }
        result
    }

    fn attempt_install(
        &self,
        target: &Target,
        request: &VersionRequest,
        install_dir: &Path,
    ) -> Result<PathBuf> {
        let staging_root = self.paths.staging_dir(target);

        remove_dir_if_exists(&staging_root, "stale staging area")?;
        remove_dir_if_exists(install_dir, "unfinished install directory")?;

        // Dropped after `attempt`, so the attempt dir is gone by then.
        let _cleanup = StagingCleanup(&staging_root);
        let attempt = in_created_dir(&staging_root, "Failed to create attempt directory", || {
            tempfile::Builder::new()
                .prefix(ATTEMPT_PREFIX)
                .tempdir_in(&staging_root)
        })?;

        let (version, spec) = self.resolver.resolve(target, request)?;
        tracing::info!(%version, "installing");

        let (archive, fetched) = self.obtain_archive(target, &spec, attempt.path())?;
        let payload = attempt.path().join(PAYLOAD_DIR);
        extract_archive(&archive, &payload)?;
        remove_shipped_marker(&payload)?;
        self.verify_payload(target, &payload)?;

        let parent = install_dir.parent().unwrap_or(self.paths.root());
        in_created_dir(parent, "Failed to move installation into place", || {
            std::fs::rename(&payload, install_dir)
        })?;

        let record = InstallRecord::now(version, spec.sha256());
        if let Err(e) = record.write_atomic(&self.paths.marker_path(target)) {
            let _ = std::fs::remove_dir_all(install_dir);
            return Err(e);
        }

        if fetched
            && self.use_cache
            && let Err(e) = self.cache.store(target, spec.sha256(), &archive)
        {
            tracing::warn!(error = %e, "could not cache archive");
        }

        tracing::info!(
            version = %record.version,
            dir = %install_dir.display(),
            "installation committed"
        );
        Ok(install_dir.to_path_buf())
    }

    /// Checks the extracted tree before it may be committed.
    fn verify_payload(&self, target: &Target, payload: &Path) -> Result<()> {
        let required = self
            .required_files
            .get(target.namespace())
            .map_or(&[][..], Vec::as_slice);
        for file in required {
            if !payload.join(file).is_file() {
                return Err(ToolchainError::verification_failed(
                    file,
                    "required file is missing from the archive",
                ));
            }
        }
        if let Some(check) = &self.payload_check {
            check(target, payload)?;
        }
        tracing::debug!(
            required = required.len(),
            custom = self.payload_check.is_some(),
            "payload verified"
        );
        Ok(())
    }

    /// A verified archive for `spec`, from the cache if possible. The flag is
    /// `true` if it was downloaded into `work_dir`.
    fn obtain_archive(
        &self,
        target: &Target,
        spec: &ArchiveSpec,
        work_dir: &Path,
    ) -> Result<(PathBuf, bool)> {
        if self.use_cache
            && let Some(cached) = self.cache.lookup(target, spec.sha256())
        {
            tracing::info!(path = %cached.display(), "reusing cached archive");
            return Ok((cached, false));
        }

        Ok((self.fetcher.fetch(spec, work_dir)?, true))
    }

    /// Removes `target`'s install directory and lock file.
    ///
    /// Must not run concurrently with an install of the same target. Cached
    /// archives are kept.
    ///
    /// # Errors
    ///
    /// Returns an [`InstallError`] wrapping [`ToolchainError::Io`] if removal
    /// fails.
    pub fn purge(&self, target: &Target) -> std::result::Result<(), InstallError> {
        let _span = tracing::info_span!("purge", %target).entered();
        self.purge_inner(target)
            .map_err(|cause| InstallError::new(target.clone(), cause))
    }

    fn purge_inner(&self, target: &Target) -> Result<()> {
        let install_dir = self.paths.install_dir(target);
        remove_dir_if_exists(&install_dir, "install directory")?;
        remove_dir_if_exists(&self.paths.staging_dir(target), "staging area")?;

        let lock_path = self.paths.lock_path(target);
        match std::fs::remove_file(&lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ToolchainError::io("Failed to remove lock file", &lock_path, e)),
        }

        tracing::info!(dir = %install_dir.display(), "purged");
        Ok(())
    }

    #[must_use]
    pub fn is_installed(&self, target: &Target) -> bool {
        self.paths.is_installed(target)
    }

    /// The marker contents of an installed target, or `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::CorruptMarker`] if the marker cannot be parsed.
    pub fn installed_version(&self, target: &Target) -> Result<Option<InstallRecord>> {
        let marker = self.paths.marker_path(target);
        if !marker.is_file() {
            return Ok(None);
        }
        InstallRecord::read(&marker).map(Some)
    }

    /// Every installed target under the root, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be walked or a marker is corrupt.
    pub fn list_installed(&self) -> Result<Vec<(Target, InstallRecord)>> {
        self.paths.list_installed()
    }

    /// Deletes all cached archives and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] on filesystem failures.
    pub fn clear_archive_cache(&self) -> Result<usize> {
        self.cache.clear()
    }

    /// Total size of cached archives in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Io`] on filesystem failures.
    pub fn archive_cache_size(&self) -> Result<u64> {
        self.cache.size_bytes()
    }
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("root", &self.paths.root())
            .field("resolver", &self.resolver)
            .field("use_cache", &self.use_cache)
            .field("lock_timeout", &self.lock_timeout)
            .field("required_files", &self.required_files)
            .field("payload_check", &self.payload_check.is_some())
            .finish_non_exhaustive()
    }
}

/// Removes a target's staging area when dropped, then the shared staging
/// directory if nothing else is staged there.
struct StagingCleanup<'a>(&'a Path);

impl Drop for StagingCleanup<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %self.0.display(), error = %e, "could not remove staging area");
        }
        if let Some(shared) = self.0.parent() {
            let _ = std::fs::remove_dir(shared);
        }
    }
}

/// Creates `dir` and runs `op`, again if `op` reports `NotFound` because a
/// concurrent cleanup of another target removed an empty shared parent.
fn in_created_dir<T>(
    dir: &Path,
    what: &str,
    mut op: impl FnMut() -> std::io::Result<T>,
) -> Result<T> {
    let mut retries = 0;
    loop {
        match std::fs::create_dir_all(dir).and_then(|()| op()) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && retries < CREATE_RETRIES => {
                retries += 1;
            }
            result => return result.map_err(|e| ToolchainError::io(what, dir, e)),
        }
    }
}

/// Removes the empty directories between `dir` and `root` left by a failed
/// attempt.
fn prune_empty_parents(dir: &Path, root: &Path) {
    let mut current = dir.parent();
    while let Some(parent) = current
        && parent != root
        && parent.starts_with(root)
    {
        if std::fs::remove_dir(parent).is_err() {
            break;
        }
        current = parent.parent();
    }
}

fn remove_dir_if_exists(dir: &Path, what: &str) -> Result<()> {
    let Ok(meta) = std::fs::symlink_metadata(dir) else {
        return Ok(());
    };
    tracing::debug!(dir = %dir.display(), "removing {what}");
    if meta.is_dir() {
        std::fs::remove_dir_all(dir)
    } else {
        std::fs::remove_file(dir)
    }
    .map_err(|e| ToolchainError::io(format!("Failed to remove {what}"), dir, e))
}

/// An archive cannot commit itself: a marker at the payload root is dropped.
fn remove_shipped_marker(payload: &Path) -> Result<()> {
    let marker = payload.join(MARKER_FILE);
    let Ok(meta) = std::fs::symlink_metadata(&marker) else {
        return Ok(());
    };
    tracing::warn!(path = %marker.display(), "archive contains a marker file; ignoring it");
    if meta.is_dir() {
        std::fs::remove_dir_all(&marker)
    } else {
        std::fs::remove_file(&marker)
    }
    .map_err(|e| ToolchainError::io("Failed to remove shipped marker", &marker, e))
}
