//! Filesystem helpers shared by the workspace, cache and assembler.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Totals for a copied or scanned tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

/// Recursively copy `from` into `to`, creating `to` if needed. Permissions
/// are preserved; symlinks are recreated rather than followed.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    fs::create_dir_all(to)?;

    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
            stats.files += 1;
        } else {
            stats.bytes += fs::copy(entry.path(), &dest)?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

/// Count files and bytes under `dir`.
pub fn tree_stats(dir: &Path) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_dir() {
            stats.files += 1;
            stats.bytes += entry.metadata().map_err(io::Error::other)?.len();
        }
    }
    Ok(stats)
}

/// Every non-directory entry under `dir`, relative to it, sorted, with `/`
/// separators.
pub fn relative_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?;
        files.push(slash_path(relative));
    }
    files.sort();
    Ok(files)
}

/// Render a relative path with `/` separators regardless of platform.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Remove a file or directory tree; missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|_| true),
        Ok(_) => fs::remove_file(path).map(|_| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copy a single file through a sibling temporary and rename it into place,
/// so `to` is either absent or complete.
pub fn copy_atomic(from: &Path, to: &Path) -> io::Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = to.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let bytes = fs::copy(from, &tmp)?;
    if let Err(e) = fs::rename(&tmp, to) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(bytes)
}
