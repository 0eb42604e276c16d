//! Recursive-copy driver for hosts without overlayfs.
//!
//! The merged view is a plain directory: lowers are copied in order (later
//! ones overwrite earlier ones) and a snapshot is taken. `flush` copies what
//! changed since that snapshot into the upper. Deletions cannot be expressed
//! and are dropped.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use stratum_core::error::{Result, StratumError};

use super::snapshot::DirSnapshot;
use super::MountDriver;
use crate::fs::{clear_dir, copy_dir_recursive, copy_entry};

#[derive(Default)]
pub struct CopyDriver {
    snapshots: Mutex<HashMap<PathBuf, DirSnapshot>>,
}

impl CopyDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountDriver for CopyDriver {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn mount(&self, target: &Path, upper: &Path, lowers: &[PathBuf]) -> Result<()> {
        std::fs::create_dir_all(target)
            .map_err(|e| StratumError::mount(target, format!("Failed to create target: {}", e)))?;

        for layer in lowers.iter().map(PathBuf::as_path).chain(std::iter::once(upper)) {
            if !layer.exists() {
                continue;
            }
            copy_dir_recursive(layer, target).map_err(|e| {
                StratumError::mount(
                    target,
                    format!("Failed to copy {}: {}", layer.display(), e),
                )
            })?;
        }

        let snapshot = DirSnapshot::capture(target)?;
        tracing::debug!(
            target = %target.display(),
            lowers = lowers.len(),
            entries = snapshot.entries.len(),
            "Materialized copy view"
        );
        self.snapshots.lock().insert(target.to_path_buf(), snapshot);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if self.snapshots.lock().remove(target).is_none() {
            return Ok(());
        }
        clear_dir(target)
            .map_err(|e| StratumError::mount(target, format!("Failed to clear view: {}", e)))
    }

    fn flush(&self, target: &Path, upper: &Path) -> Result<()> {
        let before = match self.snapshots.lock().get(target) {
            Some(snapshot) => snapshot.clone(),
            None => return Ok(()),
        };
        let after = DirSnapshot::capture(target)?;

        let changed = before.diff(&after);
        let removed = before.removed(&after);
        if !removed.is_empty() {
            tracing::warn!(
                target = %target.display(),
                count = removed.len(),
                "Deletions are not recorded by the copy driver"
            );
        }

        for relative in &changed {
            let src = target.join(relative);
            let dst = upper.join(relative);
            let result = if src.is_dir() && !src.is_symlink() {
                // Parents come first in sorted order; only the directory itself
                // is recorded, its changed children follow.
                std::fs::create_dir_all(&dst).and_then(|_| {
                    let mode = std::fs::metadata(&src)?.permissions().mode();
                    std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(mode))
                })
            } else {
                copy_entry(&src, &dst)
            };
            result.map_err(|e| {
                StratumError::mount(
                    target,
                    format!("Failed to record change {}: {}", relative.display(), e),
                )
            })?;
        }

        tracing::debug!(target = %target.display(), changed = changed.len(), "Flushed copy view");
        self.snapshots.lock().insert(target.to_path_buf(), after);
        Ok(())
    }
}
