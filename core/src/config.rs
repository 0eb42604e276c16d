//! Builder configuration.
//!
//! Loaded from YAML, then overridden by `STRATUM_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StratumError};

/// Environment variable overriding [`BuilderConfig::root_dir`].
pub const ENV_ROOT: &str = "STRATUM_ROOT";
/// Environment variable overriding [`BuilderConfig::mount_driver`].
pub const ENV_MOUNT_DRIVER: &str = "STRATUM_MOUNT_DRIVER";
/// Environment variable overriding [`BuilderConfig::no_cache`].
pub const ENV_NO_CACHE: &str = "STRATUM_NO_CACHE";

/// Which mount strategy the engine should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountDriverKind {
    /// Overlay when the host supports it, copy otherwise.
    #[default]
    Auto,
    Overlay,
    Copy,
}

impl std::fmt::Display for MountDriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Overlay => write!(f, "overlay"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

impl std::str::FromStr for MountDriverKind {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "overlay" => Ok(Self::Overlay),
            "copy" => Ok(Self::Copy),
            other => Err(StratumError::Config(format!(
                "unknown mount driver: '{}' (supported: auto, overlay, copy)",
                other
            ))),
        }
    }
}

/// Full builds run every instruction; lite builds skip CMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Full,
    Lite,
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Lite => write!(f, "lite"),
        }
    }
}

impl std::str::FromStr for BuildMode {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "lite" => Ok(Self::Lite),
            other => Err(StratumError::Config(format!(
                "unknown build mode: '{}' (supported: full, lite)",
                other
            ))),
        }
    }
}

/// Builder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Store root: blobs, layer metadata, layer data and the image index
    pub root_dir: PathBuf,

    /// Parent directory for mount targets and upper dirs
    pub tmp_dir: PathBuf,

    /// Mount strategy preference
    pub mount_driver: MountDriverKind,

    /// Build mode
    pub build_mode: BuildMode,

    /// Never consult or disturb the cache
    pub no_cache: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self::with_root(default_root())
    }
}

impl BuilderConfig {
    /// Configuration rooted at `root`, with the temp dir beneath it.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root_dir = root.into();
        Self {
            tmp_dir: root_dir.join("tmp"),
            root_dir,
            mount_driver: MountDriverKind::Auto,
            build_mode: BuildMode::Full,
            no_cache: false,
        }
    }

    /// Load from a YAML file (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    StratumError::Config(format!(
                        "Failed to read config {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::debug!(path = %path.display(), "Loaded builder config");
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        tracing::debug!(
            root = %config.root_dir.display(),
            driver = %config.mount_driver,
            mode = %config.build_mode,
            no_cache = config.no_cache,
            "Builder config resolved"
        );
        Ok(config)
    }

    /// Parse YAML. A missing `tmp_dir` follows `root_dir`.
    pub fn from_yaml(text: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            root_dir: Option<PathBuf>,
            tmp_dir: Option<PathBuf>,
            #[serde(default)]
            mount_driver: MountDriverKind,
            #[serde(default)]
            build_mode: BuildMode,
            #[serde(default)]
            no_cache: bool,
        }

        let raw: Raw = serde_yaml::from_str(text)
            .map_err(|e| StratumError::Config(format!("Invalid config: {}", e)))?;

        let mut config = Self::with_root(raw.root_dir.unwrap_or_else(default_root));
        if let Some(tmp) = raw.tmp_dir {
            config.tmp_dir = tmp;
        }
        config.mount_driver = raw.mount_driver;
        config.build_mode = raw.build_mode;
        config.no_cache = raw.no_cache;
        Ok(config)
    }

    /// Apply `STRATUM_ROOT`, `STRATUM_MOUNT_DRIVER` and `STRATUM_NO_CACHE`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var(ENV_ROOT) {
            if !root.trim().is_empty() {
                let follows_root = self.tmp_dir == self.root_dir.join("tmp");
                self.root_dir = PathBuf::from(root.trim());
                if follows_root {
                    self.tmp_dir = self.root_dir.join("tmp");
                }
            }
        }

        if let Ok(driver) = std::env::var(ENV_MOUNT_DRIVER) {
            self.mount_driver = driver.parse()?;
        }

        if let Ok(flag) = std::env::var(ENV_NO_CACHE) {
            self.no_cache = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        Ok(())
    }

    /// Create the root and temp directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.root_dir, &self.tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                StratumError::Config(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stratum"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/stratum"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var(ENV_ROOT);
        std::env::remove_var(ENV_MOUNT_DRIVER);
        std::env::remove_var(ENV_NO_CACHE);
    }

    #[test]
    fn test_default_tmp_under_root() {
        let config = BuilderConfig::with_root("/srv/stratum");
        assert_eq!(config.tmp_dir, PathBuf::from("/srv/stratum/tmp"));
        assert_eq!(config.mount_driver, MountDriverKind::Auto);
        assert_eq!(config.build_mode, BuildMode::Full);
        assert!(!config.no_cache);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = BuilderConfig::from_yaml(
            "root_dir: /data/stratum\nmount_driver: copy\nbuild_mode: lite\n",
        )
        .unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/data/stratum"));
        assert_eq!(config.tmp_dir, PathBuf::from("/data/stratum/tmp"));
        assert_eq!(config.mount_driver, MountDriverKind::Copy);
        assert_eq!(config.build_mode, BuildMode::Lite);
    }

    #[test]
    fn test_from_yaml_explicit_tmp() {
        let config =
            BuilderConfig::from_yaml("root_dir: /a\ntmp_dir: /scratch\nno_cache: true\n").unwrap();
        assert_eq!(config.tmp_dir, PathBuf::from("/scratch"));
        assert!(config.no_cache);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_driver() {
        let err = BuilderConfig::from_yaml("mount_driver: zfs\n").unwrap_err();
        assert!(matches!(err, StratumError::Config(_)));
    }

    #[test]
    fn test_mount_driver_kind_parse_and_display() {
        assert_eq!("Overlay".parse::<MountDriverKind>().unwrap(), MountDriverKind::Overlay);
        assert_eq!(MountDriverKind::Copy.to_string(), "copy");
        assert!("btrfs".parse::<MountDriverKind>().is_err());
        assert_eq!("LITE".parse::<BuildMode>().unwrap(), BuildMode::Lite);
    }

    #[test]
    #[serial]
    fn test_load_applies_env_overrides() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stratum.yaml");
        std::fs::write(&path, "root_dir: /from/file\n").unwrap();

        std::env::set_var(ENV_ROOT, "/from/env");
        std::env::set_var(ENV_MOUNT_DRIVER, "copy");
        std::env::set_var(ENV_NO_CACHE, "1");

        let config = BuilderConfig::load(Some(&path)).unwrap();
        clear_env();

        assert_eq!(config.root_dir, PathBuf::from("/from/env"));
        assert_eq!(config.tmp_dir, PathBuf::from("/from/env/tmp"));
        assert_eq!(config.mount_driver, MountDriverKind::Copy);
        assert!(config.no_cache);
    }

    #[test]
    #[serial]
    fn test_load_bad_env_driver_fails() {
        clear_env();
        std::env::set_var(ENV_MOUNT_DRIVER, "nfs");
        let result = BuilderConfig::load(None);
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_missing_file() {
        clear_env();
        let err = BuilderConfig::load(Some(Path::new("/nonexistent/stratum.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = TempDir::new().unwrap();
        let config = BuilderConfig::with_root(dir.path().join("root"));
        config.ensure_dirs().unwrap();
        assert!(config.root_dir.is_dir());
        assert!(config.tmp_dir.is_dir());
    }
}
