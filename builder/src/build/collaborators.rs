//! Seams to the outside world: running commands, fetching base images and
//! mirroring referenced images.
//!
//! The defaults here only act locally. Registry transfer lives behind
//! `ImageMirror` and `ImagePuller` and is provided by the embedding program.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use stratum_core::error::{Result, StratumError};

use crate::store::ImageStore;

/// Directory under a rootfs that receives mirrored images.
pub const REGISTRY_DIR: &str = "registry";

// ============================================================================
// Command execution
// ============================================================================

/// Runs RUN/CMD instructions against a merged view.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` with `workdir` as the working directory. Returns the
    /// combined output.
    async fn run(&self, command: &str, workdir: &Path) -> Result<String>;
}

/// Runs commands through `sh -c`, with the view root prepended to `PATH`.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, workdir: &Path) -> Result<String> {
        let path = match std::env::var("PATH") {
            Ok(existing) if !existing.is_empty() => format!("{}:{}", workdir.display(), existing),
            _ => workdir.display().to_string(),
        };

        tracing::debug!(command, workdir = %workdir.display(), "Running command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .env("PATH", path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StratumError::Execution {
                command: command.to_string(),
                exit_code: -1,
                output: format!("Failed to spawn shell: {}", e),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(StratumError::Execution {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                output: combined,
            });
        }

        if !combined.trim().is_empty() {
            tracing::info!(command, output = %combined.trim_end(), "Command output");
        }
        Ok(combined)
    }
}

// ============================================================================
// Image mirroring
// ============================================================================

/// Saves referenced images under a rootfs registry directory.
#[async_trait]
pub trait ImageMirror: Send + Sync {
    async fn mirror(&self, images: &[String], registry_dir: &Path) -> Result<()>;
}

/// Records requested references and logs them. Transfer is left to the
/// embedding program.
#[derive(Debug, Default)]
pub struct LoggingMirror {
    requested: Mutex<Vec<String>>,
}

impl LoggingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reference handed to this mirror so far, in request order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl ImageMirror for LoggingMirror {
    async fn mirror(&self, images: &[String], registry_dir: &Path) -> Result<()> {
        if images.is_empty() {
            return Ok(());
        }
        for image in images {
            tracing::info!(image = %image, registry = %registry_dir.display(), "Mirror requested");
        }
        self.requested.lock().extend(images.iter().cloned());
        Ok(())
    }
}

/// Normalise a list of image references: blank lines and `#` comments are
/// dropped, surrounding quotes trimmed and duplicates removed (first wins).
pub fn format_images<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut images = Vec::new();

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let image = trim_quotes(line);
        if image.is_empty() {
            continue;
        }
        if seen.insert(image.to_string()) {
            images.push(image.to_string());
        }
    }

    images
}

fn trim_quotes(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let last = bytes[bytes.len() - 1];
        if bytes[0] == last && (last == b'"' || last == b'\'') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

// ============================================================================
// Base images
// ============================================================================

/// Makes a named image available in the local image store.
#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull_if_not_exist(&self, name: &str) -> Result<()>;
}

/// Resolves only images already in the local store.
pub struct LocalPuller {
    images: Arc<ImageStore>,
}

impl LocalPuller {
    pub fn new(images: Arc<ImageStore>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl ImagePuller for LocalPuller {
    async fn pull_if_not_exist(&self, name: &str) -> Result<()> {
        match self.images.get_by_name(name).await {
            Ok(_) => {
                tracing::debug!(image = name, "Base image present locally");
                Ok(())
            }
            Err(StratumError::NotFound(_)) => Err(StratumError::NotFound(format!(
                "image '{}' is not in the local store and no registry puller is configured",
                name
            ))),
            Err(e) => Err(e),
        }
    }
}
