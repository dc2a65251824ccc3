//! Archive extraction.
//!
//! This module unpacks verified archives into a staging directory. The format
//! is sniffed from the leading bytes, not the file name: zstd- or
//! gzip-compressed tar, plain tar, or ZIP. Tar streams are decompressed on the
//! fly and never held in memory.
//!
//! ## Extraction Policy
//!
//! Archives come from the network, so every entry is checked before anything
//! is written for it:
//!
//! - absolute paths, `..` segments and drive prefixes fail the whole extraction
//! - entries whose parent path passes through an already-extracted symlink are
//!   rejected
//! - symlinks are created only if their target, resolved lexically from the
//!   link's own directory, stays inside the destination; once every entry is
//!   written, each link is resolved again through the links on disk, so a
//!   chain of individually harmless links cannot point outside either
//! - hard links are created only if their source is a file already extracted
//!   inside the destination
//! - device and FIFO entries are skipped
//! - permission bits (`mode & 0o777`) are preserved
//!
//! If all entries share one top-level directory and at least one entry is
//! nested below it, that directory is stripped (e.g. `toolchain-1.2.3/bin/clang`
//! becomes `bin/clang`).

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::errors::{Result, ToolchainError};
use crate::permissions::set_executable_permissions;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];

/// Longest chain of symlinks followed while resolving a single link.
const MAX_LINK_HOPS: usize = 40;

/// Container format detected from an archive's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// zstd-compressed tar.
    TarZst,
    /// gzip-compressed tar.
    TarGz,
    /// Uncompressed tar.
    Tar,
    /// ZIP.
    Zip,
}

/// Detects the archive format from magic bytes.
///
/// Anything that is not zstd, gzip or ZIP is assumed to be a plain tar.
///
/// # Errors
///
/// Returns [`ToolchainError::Io`] if the file cannot be read.
pub fn detect_format(archive_path: &Path) -> Result<ArchiveFormat> {
    let mut file = File::open(archive_path)
        .map_err(|e| ToolchainError::io("Failed to open archive", archive_path, e))?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file
            .read(&mut magic[filled..])
            .map_err(|e| ToolchainError::io("Failed to read archive", archive_path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let magic = &magic[..filled];

    Ok(if magic.starts_with(&ZSTD_MAGIC) {
        ArchiveFormat::TarZst
    } else if magic.starts_with(&GZIP_MAGIC) {
        ArchiveFormat::TarGz
    } else if magic.starts_with(&ZIP_MAGIC) || magic.starts_with(&ZIP_EMPTY_MAGIC) {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::Tar
    })
}

/// Extracts an archive to the destination directory.
///
/// Detects the format from the archive contents, applies the extraction
/// policy described in the module docs, then makes binaries executable.
/// Creates the destination directory if it does not exist.
///
/// On error the destination may hold a partial tree; callers extract into a
/// staging directory they can discard.
///
/// # Errors
///
/// Returns [`ToolchainError::Extraction`] for malformed archives and entries
/// that violate the policy, and [`ToolchainError::Io`] for local filesystem
/// failures.
///
/// # Example
///
/// ```ignore
/// extract_archive(Path::new("archive"), Path::new("staging/payload"))?;
/// ```
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let format = detect_format(archive_path)?;
    let _span = tracing::info_span!(
        "extract",
        archive = %archive_path.display(),
        ?format
    )
    .entered();

    std::fs::create_dir_all(dest_dir)
        .map_err(|e| ToolchainError::io("Failed to create directory", dest_dir, e))?;

    let entries = match format {
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir)?,
        _ => extract_tar(archive_path, format, dest_dir)?,
    };

    verify_symlinks_contained(dest_dir)?;
    set_executable_permissions(dest_dir)?;
    tracing::info!(entries, dest = %dest_dir.display(), "extracted");
    Ok(())
}

/// Opens the decompressed tar stream of `archive_path`.
fn open_tar(archive_path: &Path, format: ArchiveFormat) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(archive_path)
        .map_err(|e| ToolchainError::io("Failed to open archive", archive_path, e))?;

    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarZst => Box::new(
            zstd::stream::read::Decoder::new(file)
                .map_err(|e| corrupt(archive_path, &e))?,
        ),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(BufReader::new(file))),
        ArchiveFormat::Tar | ArchiveFormat::Zip => Box::new(BufReader::new(file)),
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_unpack_xattrs(false);
    Ok(archive)
}

/// Extracts a tar-based archive, returning the number of entries written.
fn extract_tar(archive_path: &Path, format: ArchiveFormat, dest_dir: &Path) -> Result<usize> {
    let strip_prefix = find_common_root_folder_tar(archive_path, format)?;

    let mut archive = open_tar(archive_path, format)?;
    let mut written = 0;

    for entry in archive.entries().map_err(|e| corrupt(archive_path, &e))? {
        let mut entry = entry.map_err(|e| corrupt(archive_path, &e))?;
        let raw_path = entry.path().map_err(|e| corrupt(archive_path, &e))?.into_owned();

        let Some(relative) = relative_output_path(&raw_path, strip_prefix.as_deref())? else {
            continue;
        };
        let output_path = dest_dir.join(&relative);
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Directory => {
                create_dir_checked(dest_dir, &relative)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                prepare_output(dest_dir, &relative)?;
                entry
                    .unpack(&output_path)
                    .map_err(|e| ToolchainError::io("Failed to extract", &output_path, e))?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| corrupt(archive_path, &e))?
                    .ok_or_else(|| ToolchainError::extraction(&raw_path, "symlink without target"))?
                    .into_owned();
                create_symlink(dest_dir, &relative, &target)?;
            }
            EntryType::Link => {
                let source = entry
                    .link_name()
                    .map_err(|e| corrupt(archive_path, &e))?
                    .ok_or_else(|| ToolchainError::extraction(&raw_path, "hard link without source"))?
                    .into_owned();
                let Some(source) = relative_output_path(&source, strip_prefix.as_deref())? else {
                    return Err(ToolchainError::extraction(
                        &raw_path,
                        "hard link source is the archive root",
                    ));
                };
                create_hard_link(dest_dir, &relative, &source)?;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                tracing::debug!(path = %raw_path.display(), "skipping special file");
                continue;
            }
            other => {
                tracing::debug!(path = %raw_path.display(), kind = ?other, "skipping unsupported entry");
                continue;
            }
        }
        written += 1;
    }

    Ok(written)
}

/// Finds a common root folder shared by all tar entries.
///
/// Returns `Some(prefix)` if all entries start with the same folder name
/// AND there are nested entries (paths with more than one component).
/// Otherwise returns `None`.
///
/// Unsafe entry paths are reported here, before anything is written.
fn find_common_root_folder_tar(
    archive_path: &Path,
    format: ArchiveFormat,
) -> Result<Option<PathBuf>> {
    let mut archive = open_tar(archive_path, format)?;
    let mut paths = Vec::new();

    for entry in archive.entries().map_err(|e| corrupt(archive_path, &e))? {
        let entry = entry.map_err(|e| corrupt(archive_path, &e))?;
        let raw_path = entry.path().map_err(|e| corrupt(archive_path, &e))?;
        if let Some(path) = sanitize_entry_path(&raw_path)? {
            paths.push(path);
        }
    }

    Ok(common_root(&paths))
}

/// Extracts a ZIP archive, returning the number of entries written.
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .map_err(|e| ToolchainError::io("Failed to open archive", archive_path, e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| corrupt(archive_path, &e))?;

    let mut paths = Vec::with_capacity(archive.len());
    for name in archive.file_names() {
        if let Some(path) = sanitize_entry_path(Path::new(name))? {
            paths.push(path);
        }
    }
    let strip_prefix = common_root(&paths);

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| corrupt(archive_path, &e))?;
        let raw_path = PathBuf::from(entry.name());

        let Some(relative) = relative_output_path(&raw_path, strip_prefix.as_deref())? else {
            continue;
        };
        let output_path = dest_dir.join(&relative);

        if entry.is_dir() {
            create_dir_checked(dest_dir, &relative)?;
        } else if entry.is_symlink() {
            let mut target = String::new();
            entry
                .read_to_string(&mut target)
                .map_err(|e| corrupt(archive_path, &e))?;
            create_symlink(dest_dir, &relative, Path::new(&target))?;
        } else {
            prepare_output(dest_dir, &relative)?;
            let mut outfile = File::create(&output_path)
                .map_err(|e| ToolchainError::io("Failed to create file", &output_path, e))?;
            std::io::copy(&mut entry, &mut outfile)
                .map_err(|e| ToolchainError::io("Failed to extract", &output_path, e))?;
            if let Some(mode) = entry.unix_mode() {
                apply_mode(&output_path, mode)?;
            }
        }
        written += 1;
    }

    Ok(written)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
        .map_err(|e| ToolchainError::io("Failed to set permissions", path, e))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn apply_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Validates an entry path and normalizes it to plain components.
///
/// Returns `None` for entries that name the archive root itself (`./`).
fn sanitize_entry_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => {
                if has_drive_prefix(part.to_string_lossy().as_ref()) {
                    return Err(ToolchainError::extraction(raw, "path has a drive prefix"));
                }
                clean.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ToolchainError::extraction(
                    raw,
                    "path escapes the target directory",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolchainError::extraction(raw, "path is absolute"));
            }
        }
    }
    Ok(if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    })
}

fn has_drive_prefix(part: &str) -> bool {
    let bytes = part.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Sanitizes `raw` and strips the common root, if any.
///
/// Returns `None` for entries that vanish after stripping (the root folder
/// itself).
fn relative_output_path(raw: &Path, strip_prefix: Option<&Path>) -> Result<Option<PathBuf>> {
    let Some(clean) = sanitize_entry_path(raw)? else {
        return Ok(None);
    };
    let Some(prefix) = strip_prefix else {
        return Ok(Some(clean));
    };
    Ok(match clean.strip_prefix(prefix) {
        Ok(p) if p.as_os_str().is_empty() => None,
        Ok(p) => Some(p.to_path_buf()),
        Err(_) => Some(clean),
    })
}

/// Common root folder of sanitized entry paths, if it is a real folder.
fn common_root(paths: &[PathBuf]) -> Option<PathBuf> {
    let mut common_root: Option<PathBuf> = None;
    let mut has_nested_entries = false;

    for path in paths {
        if path.components().count() > 1 {
            has_nested_entries = true;
        }

        let first_component = path.components().next()?;
        let root = PathBuf::from(first_component.as_os_str());

        match &common_root {
            None => common_root = Some(root),
            Some(existing) if existing != &root => return None,
            Some(_) => {}
        }
    }

    // Only strip if the root is a containing folder, not a lone file.
    if has_nested_entries { common_root } else { None }
}

/// Fails if any existing ancestor of `relative` (below `dest_dir`) is a
/// symlink.
fn reject_symlink_ancestors(dest_dir: &Path, relative: &Path) -> Result<()> {
    let mut current = dest_dir.to_path_buf();
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    for component in parent.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ToolchainError::extraction(
                    relative,
                    "path passes through a symlink",
                ));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

/// Creates the parent directories of `relative` and removes anything but a
/// directory already sitting at its path.
fn prepare_output(dest_dir: &Path, relative: &Path) -> Result<()> {
    reject_symlink_ancestors(dest_dir, relative)?;
    let output_path = dest_dir.join(relative);

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ToolchainError::io("Failed to create directory", parent, e))?;
    }

    if let Ok(meta) = std::fs::symlink_metadata(&output_path) {
        if meta.is_dir() {
            return Err(ToolchainError::extraction(
                relative,
                "entry would replace a directory",
            ));
        }
        std::fs::remove_file(&output_path)
            .map_err(|e| ToolchainError::io("Failed to replace file", &output_path, e))?;
    }
    Ok(())
}

fn create_dir_checked(dest_dir: &Path, relative: &Path) -> Result<()> {
    reject_symlink_ancestors(dest_dir, relative)?;
    let output_path = dest_dir.join(relative);

    if let Ok(meta) = std::fs::symlink_metadata(&output_path)
        && !meta.is_dir()
    {
        std::fs::remove_file(&output_path)
            .map_err(|e| ToolchainError::io("Failed to replace file", &output_path, e))?;
    }
    std::fs::create_dir_all(&output_path)
        .map_err(|e| ToolchainError::io("Failed to create directory", &output_path, e))
}

/// Creates a symlink at `relative` pointing to `target`, if `target` stays
/// inside the destination.
fn create_symlink(dest_dir: &Path, relative: &Path, target: &Path) -> Result<()> {
    if !link_target_is_contained(relative, target) {
        return Err(ToolchainError::extraction(
            relative,
            format!("symlink target {} escapes the target directory", target.display()),
        ));
    }
    prepare_output(dest_dir, relative)?;
    let output_path = dest_dir.join(relative);

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &output_path)
        .map_err(|e| ToolchainError::io("Failed to create symlink", &output_path, e))?;

    #[cfg(not(unix))]
    tracing::warn!(path = %output_path.display(), "symlinks are not supported here, skipping");

    Ok(())
}

/// Resolves `target` lexically from the directory holding `link` and checks
/// that it never climbs above the destination root.
fn link_target_is_contained(link: &Path, target: &Path) -> bool {
    let mut depth: usize = link.parent().map_or(0, |p| p.components().count());
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Walks the extracted tree without following links and resolves every
/// symlink through the tree as it now exists on disk.
///
/// A link that passed the lexical check can still escape through another
/// link, e.g. `bin/up -> ..` next to `bin/out -> up/..`. Entry order does not
/// matter here because all links exist by the time this runs.
fn verify_symlinks_contained(dest_dir: &Path) -> Result<()> {
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let dir = dest_dir.join(&relative);
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| ToolchainError::io("Failed to read directory", &dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ToolchainError::io("Failed to read directory", &dir, e))?;
            let child = relative.join(entry.file_name());
            let file_type = entry
                .file_type()
                .map_err(|e| ToolchainError::io("Failed to stat", entry.path(), e))?;

            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| ToolchainError::io("Failed to read symlink", entry.path(), e))?;
                if resolve_in_tree(dest_dir, &relative, &target).is_none() {
                    return Err(ToolchainError::extraction(
                        &child,
                        format!(
                            "symlink target {} escapes the target directory",
                            target.display()
                        ),
                    ));
                }
            } else if file_type.is_dir() {
                pending.push(child);
            }
        }
    }
    Ok(())
}

/// Resolves `target` from the directory `base` (both relative to `root`),
/// expanding symlinks met on the way. Returns `None` if the walk leaves
/// `root`, hits an absolute path or follows too many links.
fn resolve_in_tree(root: &Path, base: &Path, target: &Path) -> Option<PathBuf> {
    let mut resolved = base.to_path_buf();
    let mut remaining = VecDeque::new();
    prepend_components(&mut remaining, target)?;

    let mut hops = 0;
    while let Some(part) = remaining.pop_front() {
        if part == ".." {
            if !resolved.pop() {
                return None;
            }
            continue;
        }
        resolved.push(&part);
        let on_disk = root.join(&resolved);
        if std::fs::symlink_metadata(&on_disk).is_ok_and(|m| m.file_type().is_symlink()) {
            hops += 1;
            if hops > MAX_LINK_HOPS {
                return None;
            }
            let next = std::fs::read_link(&on_disk).ok()?;
            resolved.pop();
            prepend_components(&mut remaining, &next)?;
        }
    }
    Some(resolved)
}

fn prepend_components(remaining: &mut VecDeque<OsString>, target: &Path) -> Option<()> {
    for component in target.components().rev() {
        match component {
            Component::Normal(part) => remaining.push_front(part.to_os_string()),
            Component::ParentDir => remaining.push_front(OsString::from("..")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(())
}

fn create_hard_link(dest_dir: &Path, relative: &Path, source: &Path) -> Result<()> {
    reject_symlink_ancestors(dest_dir, source)?;
    let source_path = dest_dir.join(source);
    let is_file = std::fs::symlink_metadata(&source_path).is_ok_and(|m| m.is_file());
    if !is_file {
        return Err(ToolchainError::extraction(
            relative,
            format!("hard link source {} is not an extracted file", source.display()),
        ));
    }

    prepare_output(dest_dir, relative)?;
    let output_path = dest_dir.join(relative);
    std::fs::hard_link(&source_path, &output_path)
        .map_err(|e| ToolchainError::io("Failed to create hard link", &output_path, e))
}

fn corrupt(archive_path: &Path, error: &dyn std::fmt::Display) -> ToolchainError {
    ToolchainError::extraction(archive_path, format!("corrupt archive: {error}"))
}
