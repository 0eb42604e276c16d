//! Mount engine: merged views over ordered read-only lowers and a writable upper.
//!
//! Two strategies implement [`MountDriver`]: kernel overlayfs and a portable
//! recursive copy. One is chosen at startup from configuration and host
//! capabilities and shared by every [`MountTarget`] the engine hands out.

pub mod copy;
pub mod overlay;
pub mod snapshot;
pub mod table;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stratum_core::error::{Result, StratumError};
use stratum_core::MountDriverKind;

pub use copy::CopyDriver;
pub use overlay::OverlayDriver;
pub use table::MountInfo;

/// A strategy for producing a merged view.
pub trait MountDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Present `lowers` (bottom first) plus `upper` at `target`.
    fn mount(&self, target: &Path, upper: &Path, lowers: &[PathBuf]) -> Result<()>;

    /// Tear the view down. Unknown or already unmounted targets are a no-op.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Make sure every change made through `target` is in `upper`.
    fn flush(&self, target: &Path, upper: &Path) -> Result<()>;
}

// ============================================================================
// Host capabilities
// ============================================================================

/// What the host can do, for driver selection.
pub trait HostCapabilities {
    /// Filesystem types the kernel supports.
    fn filesystems(&self) -> Vec<String>;

    /// Whether the process may call mount(2).
    fn is_privileged(&self) -> bool;
}

/// Reads `/proc/filesystems` and the effective uid.
pub struct ProcHost;

impl HostCapabilities for ProcHost {
    fn filesystems(&self) -> Vec<String> {
        match std::fs::read_to_string("/proc/filesystems") {
            Ok(text) => parse_filesystems(&text),
            Err(e) => {
                tracing::debug!(error = %e, "Cannot read /proc/filesystems");
                Vec::new()
            }
        }
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Filesystem names from `/proc/filesystems` (`nodev\toverlay` lines included).
pub fn parse_filesystems(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Resolve a preference against the host to a concrete driver kind.
pub fn resolve_driver(preference: MountDriverKind, caps: &dyn HostCapabilities) -> MountDriverKind {
    let overlay_ok = || caps.is_privileged() && caps.filesystems().iter().any(|f| f == "overlay");

    match preference {
        MountDriverKind::Copy => MountDriverKind::Copy,
        MountDriverKind::Auto if overlay_ok() => MountDriverKind::Overlay,
        MountDriverKind::Auto => MountDriverKind::Copy,
        MountDriverKind::Overlay if overlay_ok() => MountDriverKind::Overlay,
        MountDriverKind::Overlay => {
            tracing::warn!("overlay requested but unavailable on this host, using copy driver");
            MountDriverKind::Copy
        }
    }
}

/// Build the driver for a preference.
pub fn select_driver(preference: MountDriverKind, caps: &dyn HostCapabilities) -> Arc<dyn MountDriver> {
    match resolve_driver(preference, caps) {
        MountDriverKind::Overlay => Arc::new(OverlayDriver::new()),
        _ => Arc::new(CopyDriver::new()),
    }
}

// ============================================================================
// Engine and sessions
// ============================================================================

/// Hands out mount sessions backed by one driver.
#[derive(Clone)]
pub struct MountEngine {
    driver: Arc<dyn MountDriver>,
    tmp_root: PathBuf,
}

impl MountEngine {
    /// `tmp_root` is created if missing and stored resolved, so session
    /// paths match what the kernel reports in the mount table.
    pub fn new(driver: Arc<dyn MountDriver>, tmp_root: impl Into<PathBuf>) -> Result<Self> {
        let tmp_root = tmp_root.into();
        std::fs::create_dir_all(&tmp_root).map_err(|e| {
            StratumError::Config(format!(
                "Failed to create temp root {}: {}",
                tmp_root.display(),
                e
            ))
        })?;
        let tmp_root = std::fs::canonicalize(&tmp_root).map_err(|e| {
            StratumError::Config(format!(
                "Failed to resolve temp root {}: {}",
                tmp_root.display(),
                e
            ))
        })?;
        tracing::debug!(driver = driver.name(), tmp = %tmp_root.display(), "Mount engine ready");
        Ok(Self { driver, tmp_root })
    }

    /// Engine with the driver chosen by probing this host.
    pub fn probe(preference: MountDriverKind, tmp_root: impl Into<PathBuf>) -> Result<Self> {
        Self::new(select_driver(preference, &ProcHost), tmp_root)
    }

    pub fn driver(&self) -> &Arc<dyn MountDriver> {
        &self.driver
    }

    pub fn tmp_root(&self) -> &Path {
        &self.tmp_root
    }

    /// New, not yet mounted, session. Missing target/upper dirs are fresh
    /// temp dirs owned by the session; no lowers means one empty temp lower.
    pub fn session(
        &self,
        target: Option<PathBuf>,
        upper: Option<PathBuf>,
        lowers: Vec<PathBuf>,
    ) -> Result<MountTarget> {
        let mut owned = Vec::new();

        let target = match target {
            Some(t) => t,
            None => self.temp_dir("mnt-", &mut owned)?,
        };
        let upper = match upper {
            Some(u) => u,
            None => self.temp_dir("upper-", &mut owned)?,
        };
        let lowers = if lowers.is_empty() {
            vec![self.temp_dir("lower-", &mut owned)?]
        } else {
            lowers
        };

        Ok(MountTarget {
            driver: self.driver.clone(),
            target,
            upper,
            lowers,
            owned,
            mounted: false,
        })
    }

    fn temp_dir(&self, prefix: &str, owned: &mut Vec<PathBuf>) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.tmp_root)
            .map_err(|e| {
                StratumError::mount(&self.tmp_root, format!("Failed to create temp dir: {}", e))
            })?
            .keep();
        owned.push(dir.clone());
        Ok(dir)
    }

    /// Overlay mounts left under the temp root, e.g. by a crashed build.
    pub fn build_mounts(&self) -> Result<Vec<MountInfo>> {
        Ok(table::overlays_under(&table::read_mount_table()?, &self.tmp_root))
    }

    /// Unmount every leftover overlay under the temp root and remove its
    /// session dirs. Returns how many were cleaned.
    pub fn clean_leftovers(&self) -> Result<usize> {
        let leftovers = self.build_mounts()?;
        Ok(self.clean_mounts(leftovers, Arc::new(OverlayDriver::new())))
    }

    fn clean_mounts(&self, leftovers: Vec<MountInfo>, driver: Arc<dyn MountDriver>) -> usize {
        let mut cleaned = 0;
        for info in leftovers {
            let target = info.target.clone();
            tracing::warn!(target = %target.display(), "Cleaning up mount left by a previous run");

            let mut session = match MountTarget::from_info(driver.clone(), info) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(target = %target.display(), error = %e, "Cannot adopt leftover mount");
                    continue;
                }
            };
            // Only session temp dirs are removed; layer dirs live elsewhere.
            session.owned = std::iter::once(&session.target)
                .chain(std::iter::once(&session.upper))
                .chain(session.lowers.iter())
                .filter(|dir| dir.starts_with(&self.tmp_root))
                .cloned()
                .collect();

            match session.cleanup() {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    tracing::warn!(target = %target.display(), error = %e, "Failed to clean leftover mount");
                }
            }
        }
        cleaned
    }
}

/// A live mount session. Dropping it unmounts and removes owned temp dirs.
pub struct MountTarget {
    driver: Arc<dyn MountDriver>,
    target: PathBuf,
    upper: PathBuf,
    lowers: Vec<PathBuf>,
    owned: Vec<PathBuf>,
    mounted: bool,
}

impl MountTarget {
    /// Adopt a mount this process did not create.
    pub fn from_info(driver: Arc<dyn MountDriver>, info: MountInfo) -> Result<Self> {
        let upper = info.upper.ok_or_else(|| {
            StratumError::mount(&info.target, "mount has no upper directory")
        })?;
        Ok(Self {
            driver,
            target: info.target,
            upper,
            lowers: info.lowers,
            owned: Vec::new(),
            mounted: true,
        })
    }

    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        self.driver.mount(&self.target, &self.upper, &self.lowers)?;
        self.mounted = true;
        Ok(())
    }

    /// Flush and unmount, leaving the upper in place for registration.
    pub fn seal(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.driver.flush(&self.target, &self.upper)?;
        self.driver.unmount(&self.target)?;
        self.mounted = false;
        Ok(())
    }

    /// Unmount if needed and remove owned temp dirs. Safe to call repeatedly.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.mounted {
            self.driver.unmount(&self.target)?;
            self.mounted = false;
        }

        for dir in self.owned.drain(..) {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StratumError::mount(&dir, format!("Failed to remove: {}", e)));
                }
            }
        }
        Ok(())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn upper(&self) -> &Path {
        &self.upper
    }

    pub fn lowers(&self) -> &[PathBuf] {
        &self.lowers
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }
}

impl Drop for MountTarget {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(target = %self.target.display(), error = %e, "Mount cleanup failed");
        }
    }
}
