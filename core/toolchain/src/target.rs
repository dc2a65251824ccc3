//! Installable targets.
//!
//! A [`Target`] is a `(namespace, platform, arch)` triple such as
//! `(compiler, linux, x86_64)`. Every namespace (compiler, sysroot, SDK,
//! analyzer, ...) goes through the same installer; the triple alone decides the
//! install directory and the lock file.
//!
//! Platform and architecture strings are taken as given. Normalizing them from
//! the host (`std::env::consts`) is the caller's job.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{Result, ToolchainError};

/// Joins the components in [`Target::slug`].
const SLUG_SEPARATOR: char = '-';

/// Identifies one installable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    namespace: String,
    platform: String,
    arch: String,
}

impl Target {
    /// Creates a target after validating each component.
    ///
    /// Components become directory names under the install root, so they must
    /// be non-empty, must not be `.` or `..`, and must not contain path
    /// separators or NUL bytes. They also join with `-` into the lock and
    /// staging names, so `-` itself is refused: otherwise
    /// `(mingw-sysroot, win, x86_64)` and `(mingw, sysroot-win, x86_64)` would
    /// share one lock.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::InvalidTarget`] for the first unsafe component.
    pub fn new(
        namespace: impl Into<String>,
        platform: impl Into<String>,
        arch: impl Into<String>,
    ) -> Result<Self> {
        let target = Self {
            namespace: namespace.into(),
            platform: platform.into(),
            arch: arch.into(),
        };
        for component in [&target.namespace, &target.platform, &target.arch] {
            validate_component(component)?;
        }
        Ok(target)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn platform(&self) -> &str {
        &self.platform
    }

    #[must_use]
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Flat identifier used for the lock file and staging area:
    /// `namespace-platform-arch`.
    #[must_use]
    pub fn slug(&self) -> String {
        format!(
            "{}{SLUG_SEPARATOR}{}{SLUG_SEPARATOR}{}",
            self.namespace, self.platform, self.arch
        )
    }

    /// Install directory relative to the install root:
    /// `namespace/platform/arch`.
    #[must_use]
    pub fn relative_dir(&self) -> PathBuf {
        Path::new(&self.namespace)
            .join(&self.platform)
            .join(&self.arch)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.platform, self.arch)
    }
}

fn validate_component(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ToolchainError::invalid_target(value, "must not be empty"));
    }
    if value == "." || value == ".." {
        return Err(ToolchainError::invalid_target(
            value,
            "must not be a relative directory reference",
        ));
    }
    if value.contains(['/', '\\', '\0']) {
        return Err(ToolchainError::invalid_target(
            value,
            "must not contain path separators or NUL",
        ));
    }
    if value.contains(SLUG_SEPARATOR) {
        return Err(ToolchainError::invalid_target(
            value,
            "must not contain '-', which separates components in lock names",
        ));
    }
    Ok(())
}
