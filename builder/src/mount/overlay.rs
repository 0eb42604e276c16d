//! Kernel overlayfs driver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use parking_lot::Mutex;
use stratum_core::error::{Result, StratumError};
use tempfile::TempDir;

use super::table;
use super::MountDriver;

/// Overlay option string. `lowers` are bottom first; overlay wants the
/// highest-precedence lower first, so they are reversed.
pub fn overlay_options(lowers: &[PathBuf], upper: &Path, workdir: &Path) -> String {
    let lowerdir = lowers
        .iter()
        .rev()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        workdir.display()
    )
}

/// Union mount through `mount -t overlay`.
#[derive(Default)]
pub struct OverlayDriver {
    /// Work dirs by mount target, removed on unmount
    workdirs: Mutex<HashMap<PathBuf, TempDir>>,
}

impl OverlayDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountDriver for OverlayDriver {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn mount(&self, target: &Path, upper: &Path, lowers: &[PathBuf]) -> Result<()> {
        if lowers.is_empty() {
            return Err(StratumError::mount(target, "overlay needs at least one lower"));
        }

        // The work dir must live on the same filesystem as the upper.
        let parent = upper.parent().unwrap_or(upper);
        let workdir = tempfile::Builder::new()
            .prefix(".work-")
            .tempdir_in(parent)
            .map_err(|e| StratumError::mount(target, format!("Failed to create workdir: {}", e)))?;

        let options = overlay_options(lowers, upper, workdir.path());
        tracing::debug!(target = %target.display(), options = %options, "Mounting overlay");

        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| StratumError::mount(target, format!("overlay mount failed: {}", e)))?;

        self.workdirs.lock().insert(target.to_path_buf(), workdir);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mounted = table::mount_details(target)?.is_some_and(|m| m.is_overlay());
        if mounted {
            match umount2(target, MntFlags::MNT_DETACH) {
                Ok(()) => tracing::debug!(target = %target.display(), "Unmounted overlay"),
                // Gone between the table read and the umount.
                Err(Errno::EINVAL | Errno::ENOENT) => {
                    tracing::debug!(target = %target.display(), "Overlay already unmounted");
                }
                Err(e) => {
                    return Err(StratumError::mount(target, format!("umount failed: {}", e)));
                }
            }
        }

        // Dropping the TempDir removes the work dir.
        self.workdirs.lock().remove(target);
        Ok(())
    }

    fn flush(&self, _target: &Path, _upper: &Path) -> Result<()> {
        // Writes already land in the upper.
        Ok(())
    }
}
