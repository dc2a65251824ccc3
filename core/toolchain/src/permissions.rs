//! Post-extraction permission fixups.
//!
//! Archives built on other hosts do not always carry usable mode bits. After
//! extraction every regular file directly under `bin/` and every shared
//! library under `lib/` is made executable (0o755). Symlinks are left alone.

use std::path::Path;

use crate::errors::Result;

/// Mode given to binaries and shared libraries.
#[cfg(unix)]
const EXECUTABLE_MODE: u32 = 0o755;

/// Sets executable permissions on binaries and shared libraries within an
/// extracted toolchain directory (Unix only).
///
/// # Arguments
///
/// * `dir` - The extracted toolchain directory.
///
/// # Errors
///
/// Returns [`ToolchainError::Io`](crate::ToolchainError::Io) if a directory
/// cannot be read or permissions cannot be set.
#[cfg(unix)]
pub fn set_executable_permissions(dir: &Path) -> Result<()> {
    let bin_dir = dir.join("bin");
    if bin_dir.is_dir() {
        for entry in read_dir(&bin_dir)? {
            make_executable_if_file(&entry)?;
        }
    }

    let lib_dir = dir.join("lib");
    if lib_dir.is_dir() {
        fix_shared_libraries(&lib_dir)?;
    }

    Ok(())
}

/// Sets executable permissions (no-op on Windows).
#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
pub fn set_executable_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn fix_shared_libraries(dir: &Path) -> Result<()> {
    for path in read_dir(dir)? {
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            fix_shared_libraries(&path)?;
        } else if meta.is_file() && is_shared_library(&path) {
            make_executable_if_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_shared_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".so") || name.ends_with(".dylib") || name.contains(".so.")
}

#[cfg(unix)]
fn make_executable_if_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    use crate::errors::ToolchainError;

    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| ToolchainError::io("Failed to get metadata", path, e))?;
    if !meta.is_file() {
        return Ok(());
    }

    let mut perms = meta.permissions();
    perms.set_mode(EXECUTABLE_MODE);
    std::fs::set_permissions(path, perms)
        .map_err(|e| ToolchainError::io("Failed to set permissions", path, e))
}

#[cfg(unix)]
fn read_dir(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    use crate::errors::ToolchainError;

    let entries = std::fs::read_dir(dir)
        .map_err(|e| ToolchainError::io("Failed to read directory", dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ToolchainError::io("Failed to read directory entry", dir, e))?;
        paths.push(entry.path());
    }
    Ok(paths)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path)
            .expect("Should stat")
            .permissions()
            .mode()
            & 0o777
    }

    fn write_with_mode(path: &Path, mode: u32) {
        std::fs::create_dir_all(path.parent().expect("Should have parent"))
            .expect("Should create dir");
        std::fs::write(path, b"x").expect("Should write");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .expect("Should chmod");
    }

    #[test]
    fn binaries_become_executable() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let tool = dir.path().join("bin/clang");
        write_with_mode(&tool, 0o644);

        set_executable_permissions(dir.path()).expect("Should fix permissions");

        assert_eq!(mode(&tool), 0o755);
    }

    #[test]
    fn shared_libraries_become_executable_but_headers_do_not() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let lib = dir.path().join("lib/x86_64/libLLVM.so.17");
        let header = dir.path().join("lib/clang/include/stddef.h");
        write_with_mode(&lib, 0o644);
        write_with_mode(&header, 0o644);

        set_executable_permissions(dir.path()).expect("Should fix permissions");

        assert_eq!(mode(&lib), 0o755);
        assert_eq!(mode(&header), 0o644);
    }

    #[test]
    fn symlinks_in_bin_are_skipped() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let real = dir.path().join("share/data.txt");
        write_with_mode(&real, 0o644);
        std::fs::create_dir_all(dir.path().join("bin")).expect("Should create dir");
        std::os::unix::fs::symlink("../share/data.txt", dir.path().join("bin/data"))
            .expect("Should create symlink");

        set_executable_permissions(dir.path()).expect("Should fix permissions");

        assert_eq!(mode(&real), 0o644);
    }

    #[test]
    fn missing_directories_are_fine() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        assert!(set_executable_permissions(dir.path()).is_ok());
    }
}
