//! Directory snapshots for change detection in the copy driver.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use stratum_core::error::{Result, StratumError};
use walkdir::WalkDir;

/// Entry kind as seen without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// File size in bytes
    pub size: u64,
    /// Modification time, nanoseconds since epoch
    pub mtime_ns: i128,
    /// Status change time; catches chmod/chown that leave mtime alone
    pub ctime_ns: i128,
    /// Permission and type bits
    pub mode: u32,
    pub kind: EntryKind,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Map of relative path → file entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

impl DirSnapshot {
    /// Record every entry below `root` (the root itself excluded).
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();

        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                StratumError::mount(root, format!("Failed to walk directory: {}", e))
            })?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| StratumError::mount(entry.path(), e.to_string()))?
                .to_path_buf();
            let meta = entry.metadata().map_err(|e| {
                StratumError::mount(entry.path(), format!("Failed to read metadata: {}", e))
            })?;

            let file_type = meta.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };

            entries.insert(
                relative,
                FileEntry {
                    size: meta.len(),
                    mtime_ns: meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128,
                    ctime_ns: meta.ctime() as i128 * 1_000_000_000 + meta.ctime_nsec() as i128,
                    mode: meta.mode(),
                    kind,
                },
            );
        }

        Ok(DirSnapshot { entries })
    }

    /// Paths added or modified between `self` (before) and `after`, sorted.
    ///
    /// Deleted paths are not reported.
    pub fn diff(&self, after: &DirSnapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, entry)| self.entries.get(*path) != Some(entry))
            .map(|(path, _)| path.clone())
            .collect();

        changed.sort();
        changed
    }

    /// Paths present before but gone in `after`, sorted.
    pub fn removed(&self, after: &DirSnapshot) -> Vec<PathBuf> {
        let mut removed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .cloned()
            .collect();
        removed.sort();
        removed
    }
}
