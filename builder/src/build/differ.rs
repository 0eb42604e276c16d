//! Post-build differs.
//!
//! A differ inspects the view made of the layers this build produced and
//! writes derived content into the build rootfs. Differs never touch the
//! view they read, so they run concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use stratum_core::error::{Result, StratumError};
use tokio::task::JoinSet;
use walkdir::WalkDir;

use super::collaborators::{format_images, ImageMirror, REGISTRY_DIR};

const MANIFESTS_DIR: &str = "manifests";
const CHARTS_DIR: &str = "charts";
const IMAGE_LIST: &str = "imageList";

/// Derives rootfs content from the new layers.
#[async_trait]
pub trait Differ: Send + Sync {
    fn name(&self) -> &'static str;

    /// `src` is the merged view of the new layers, `dst` the build rootfs.
    async fn process(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Run every differ concurrently. The first failure aborts the rest.
pub async fn run_differs(differs: &[Arc<dyn Differ>], src: &Path, dst: &Path) -> Result<()> {
    let mut set = JoinSet::new();
    for differ in differs {
        let differ = differ.clone();
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        set.spawn(async move {
            tracing::debug!(differ = differ.name(), "Running differ");
            differ.process(&src, &dst).await
        });
    }
    join_all_or_nothing(set).await.map(|_| ())
}

async fn join_all_or_nothing<T: 'static>(mut set: JoinSet<Result<T>>) -> Result<Vec<T>> {
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        let outcome = joined
            .map_err(|e| StratumError::Other(format!("Differ task failed: {}", e)))
            .and_then(|r| r);
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                set.abort_all();
                return Err(e);
            }
        }
    }
    Ok(results)
}

// ============================================================================
// Image list differ
// ============================================================================

/// Collects image references from `manifests/`, `charts/` and
/// `manifests/imageList`, then mirrors them into `<rootfs>/registry`.
pub struct ImageListDiffer {
    mirror: Arc<dyn ImageMirror>,
}

impl ImageListDiffer {
    pub fn new(mirror: Arc<dyn ImageMirror>) -> Self {
        Self { mirror }
    }
}

#[async_trait]
impl Differ for ImageListDiffer {
    fn name(&self) -> &'static str {
        "image-list"
    }

    async fn process(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut set = JoinSet::new();
        let parsers: [fn(&Path) -> Result<Vec<String>>; 3] =
            [manifest_images, chart_images, image_list_images];
        for parser in parsers {
            let src = src.to_path_buf();
            set.spawn_blocking(move || parser(&src));
        }

        let collected: Vec<String> = join_all_or_nothing(set).await?.into_iter().flatten().collect();
        let images = format_images(collected);
        if images.is_empty() {
            tracing::debug!("No image references in new layers");
            return Ok(());
        }

        tracing::info!(count = images.len(), "Collected image references");
        self.mirror.mirror(&images, &dst.join(REGISTRY_DIR)).await
    }
}

fn yaml_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            StratumError::Other(format!("Failed to walk {}: {}", dir.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.contains(&ext));
        if matches {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        StratumError::Other(format!("Failed to read {}: {}", path.display(), e))
    })
}

/// `image:` values of every manifest. Templates are scanned line by line so
/// that files which are not valid YAML yet still contribute.
fn manifest_images(src: &Path) -> Result<Vec<String>> {
    let mut images = Vec::new();
    for file in yaml_files(&src.join(MANIFESTS_DIR), &["yaml", "yml", "tmpl"])? {
        images.extend(scan_image_lines(&read_text(&file)?));
    }
    Ok(images)
}

fn scan_image_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start().trim_start_matches("- ").trim_start();
            let rest = line.strip_prefix("image:")?;
            let value = rest.split(" #").next().unwrap_or_default().trim();
            (!value.is_empty()).then(|| value.to_string())
        })
        .collect()
}

/// Images named by chart `values.yaml` files, either as plain strings or as
/// `{registry, repository, tag}` maps.
fn chart_images(src: &Path) -> Result<Vec<String>> {
    let mut images = Vec::new();
    for file in yaml_files(&src.join(CHARTS_DIR), &["yaml", "yml"])? {
        if file.file_stem().and_then(|s| s.to_str()) != Some("values") {
            continue;
        }
        let value: serde_yaml::Value = serde_yaml::from_str(&read_text(&file)?).map_err(|e| {
            StratumError::Serialization(format!("Failed to parse {}: {}", file.display(), e))
        })?;
        collect_chart_images(&value, &mut images);
    }
    Ok(images)
}

fn collect_chart_images(value: &serde_yaml::Value, out: &mut Vec<String>) {
    use serde_yaml::Value;

    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                if key.as_str() == Some("image") {
                    match child {
                        Value::String(s) => out.push(s.clone()),
                        Value::Mapping(_) => {
                            if let Some(image) = image_from_parts(child) {
                                out.push(image);
                            }
                        }
                        _ => {}
                    }
                } else {
                    collect_chart_images(child, out);
                }
            }
        }
        Value::Sequence(items) => {
            for item in items {
                collect_chart_images(item, out);
            }
        }
        _ => {}
    }
}

fn image_from_parts(map: &serde_yaml::Value) -> Option<String> {
    let field = |name: &str| -> Option<String> {
        match map.get(name)? {
            serde_yaml::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    let repository = field("repository")?;
    let mut image = match field("registry") {
        Some(registry) => format!("{}/{}", registry.trim_end_matches('/'), repository),
        None => repository,
    };
    if let Some(tag) = field("tag") {
        image.push(':');
        image.push_str(&tag);
    }
    Some(image)
}

fn image_list_images(src: &Path) -> Result<Vec<String>> {
    let path = src.join(MANIFESTS_DIR).join(IMAGE_LIST);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    Ok(read_text(&path)?.lines().map(str::to_string).collect())
}
