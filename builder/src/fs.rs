//! Filesystem helpers shared by the mount drivers, the layer store and COPY.
//!
//! These return plain `std::io::Result`; callers attach context and map to
//! the error variant of their layer.

use std::io;
use std::path::Path;

/// Recursively copy `src` into `dst`, overwriting existing entries.
///
/// Symlinks are recreated, not followed. Permissions travel with
/// `std::fs::copy`.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
    }

    Ok(())
}

/// Copy a single file, symlink or directory tree to `dst`.
pub fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        if let Ok(existing) = std::fs::symlink_metadata(dst) {
            if !existing.is_dir() {
                std::fs::remove_file(dst)?;
            }
        }
        copy_dir_recursive(src, dst)?;
        std::fs::set_permissions(dst, meta.permissions())?;
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    remove_existing(dst)?;

    if file_type.is_symlink() {
        let target = std::fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)?;
    } else {
        std::fs::copy(src, dst)?;
    }

    Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move a directory, falling back to copy + remove across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %e,
                "rename failed, copying instead"
            );
            copy_dir_recursive(src, dst)?;
            std::fs::remove_dir_all(src)
        }
    }
}

/// Remove everything inside `path`, keeping the directory itself.
pub fn clear_dir(path: &Path) -> io::Result<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        remove_existing(&entry?.path())?;
    }
    Ok(())
}
