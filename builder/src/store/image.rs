//! Image records and the name index.
//!
//! A record is the JSON image (without its id) stored as a content blob, so
//! the blob digest is the image id. `images.json` maps names to ids; several
//! names may point at the same record.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::error::{Result, StratumError};
use stratum_core::{Digest, Image};
use tokio::sync::RwLock;

use crate::store::content::{write_atomic, ContentStore};
use crate::store::layer::LayerStore;

/// Name index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub name: String,
    pub id: Digest,
    pub created: DateTime<Utc>,
    /// Sum of the content layer sizes
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NameIndex {
    images: Vec<ImageMetadata>,
}

/// Persisted images keyed by digest, with a name index.
pub struct ImageStore {
    content: Arc<dyn ContentStore>,
    layers: Arc<LayerStore>,
    index_path: PathBuf,
    index: RwLock<BTreeMap<String, ImageMetadata>>,
}

impl ImageStore {
    /// Open the store, loading `images.json` if present.
    pub fn open(root: &Path, content: Arc<dyn ContentStore>, layers: Arc<LayerStore>) -> Result<Self> {
        let index_path = root.join("images.json");
        let index = load_index(&index_path)?;
        Ok(Self {
            content,
            layers,
            index_path,
            index: RwLock::new(index),
        })
    }

    /// Persist `image` under `name`, returning its id.
    pub async fn save(&self, image: &Image, name: &str) -> Result<Digest> {
        let mut record = image.clone();
        record.name = name.to_string();
        record.id = None;

        let bytes = record.canonical_bytes()?;
        let id = self.content.put(&bytes)?;

        let size = record
            .layer_ids()
            .iter()
            .filter_map(|l| self.layers.get(l))
            .map(|l| l.size)
            .sum();

        let meta = ImageMetadata {
            name: name.to_string(),
            id: id.clone(),
            created: Utc::now(),
            size,
        };

        let mut index = self.index.write().await;
        let replaced = index.insert(name.to_string(), meta);
        self.write_index(&index)?;
        drop(index);

        if let Some(old) = replaced.filter(|old| old.id != id) {
            tracing::debug!(name, old = %old.id, "Image name moved to new record");
        }
        tracing::info!(name, image = %id, "Saved image");
        Ok(id)
    }

    /// Image currently registered under `name`.
    pub async fn get_by_name(&self, name: &str) -> Result<Image> {
        let id = {
            let index = self.index.read().await;
            index
                .get(name)
                .map(|m| m.id.clone())
                .ok_or_else(|| StratumError::NotFound(format!("image {}", name)))?
        };
        let mut image = self.get_by_id(&id)?;
        image.name = name.to_string();
        Ok(image)
    }

    /// Load a record by id.
    pub fn get_by_id(&self, id: &Digest) -> Result<Image> {
        let bytes = self.content.get(id)?;
        let mut image: Image = serde_json::from_slice(&bytes)?;
        image.id = Some(id.clone());
        Ok(image)
    }

    /// Every persisted image record. Blobs that are not images are skipped.
    pub fn list(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for (id, bytes) in self.content.list()? {
            match serde_json::from_slice::<Image>(&bytes) {
                Ok(mut image) => {
                    image.id = Some(id);
                    images.push(image);
                }
                Err(e) => tracing::warn!(blob = %id, error = %e, "Skipping unparseable image record"),
            }
        }
        Ok(images)
    }

    /// Name index entries, sorted by name.
    pub async fn names(&self) -> Vec<ImageMetadata> {
        self.index.read().await.values().cloned().collect()
    }

    /// Drop a name. When no other name references the record, the record
    /// goes too, along with its layers that no remaining record uses.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let removed = index
            .remove(name)
            .ok_or_else(|| StratumError::NotFound(format!("image {}", name)))?;
        let still_used = index.values().any(|m| m.id == removed.id);
        self.write_index(&index)?;

        if !still_used {
            let record = self.get_by_id(&removed.id)?;
            self.content.delete(&removed.id)?;
            tracing::debug!(image = %removed.id, "Deleted unreferenced image record");
            self.delete_orphan_layers(&record)?;
        }
        Ok(())
    }

    fn delete_orphan_layers(&self, removed: &Image) -> Result<()> {
        let referenced: HashSet<Digest> = self
            .list()?
            .iter()
            .flat_map(|image| image.layer_ids())
            .collect();

        for id in removed.layer_ids() {
            if referenced.contains(&id) || !self.layers.contains(&id) {
                continue;
            }
            self.layers.delete(&id)?;
            tracing::info!(layer = %id, "Deleted unreferenced layer");
        }
        Ok(())
    }

    fn write_index(&self, index: &BTreeMap<String, ImageMetadata>) -> Result<()> {
        let data = serde_json::to_vec_pretty(&NameIndex {
            images: index.values().cloned().collect(),
        })?;
        write_atomic(&self.index_path, &data)
    }
}

fn load_index(path: &Path) -> Result<BTreeMap<String, ImageMetadata>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let data = std::fs::read(path).map_err(|e| {
        StratumError::Store(format!(
            "Failed to read image index {}: {}",
            path.display(),
            e
        ))
    })?;
    let parsed: NameIndex = serde_json::from_slice(&data)
        .map_err(|e| StratumError::Store(format!("Failed to parse image index: {}", e)))?;

    Ok(parsed
        .images
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::content::FsContentStore;
    use stratum_core::{Layer, LayerKind, SCRATCH};
    use tempfile::TempDir;

    fn open(root: &Path) -> ImageStore {
        let content: Arc<dyn ContentStore> = Arc::new(FsContentStore::open(root).unwrap());
        let layers = Arc::new(LayerStore::open(root, content.clone()).unwrap());
        ImageStore::open(root, content, layers).unwrap()
    }

    fn image() -> Image {
        Image::new(
            "",
            vec![
                Layer::from_base(SCRATCH),
                Layer::new(LayerKind::Run, "echo hi"),
            ],
        )
    }

    #[tokio::test]
    async fn test_save_and_get_by_name() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path());

        let id = store.save(&image(), "app:v1").await.unwrap();
        let loaded = store.get_by_name("app:v1").await.unwrap();

        assert_eq!(loaded.id, Some(id.clone()));
        assert_eq!(loaded.name, "app:v1");
        assert_eq!(Digest::from_bytes(&loaded.canonical_bytes().unwrap()), id);
    }

    #[tokio::test]
    async fn test_get_by_name_missing() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path());
        let err = store.get_by_name("ghost").await.unwrap_err();
        assert!(matches!(err, StratumError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let id = open(tmp.path()).save(&image(), "app:v1").await.unwrap();

        let reopened = open(tmp.path());
        let names = reopened.names().await;
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].id, id);
        assert_eq!(reopened.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_keeps_shared_record() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path());
        let mut img = image();
        img.name = "app:v1".to_string();
        let id = store.save(&img, "app:v1").await.unwrap();
        // Same record under a second name.
        store.index.write().await.insert(
            "app:latest".to_string(),
            ImageMetadata {
                name: "app:latest".to_string(),
                id: id.clone(),
                created: Utc::now(),
                size: 0,
            },
        );

        store.remove("app:v1").await.unwrap();
        assert!(store.get_by_id(&id).is_ok());

        store.remove("app:latest").await.unwrap();
        assert!(matches!(store.get_by_id(&id), Err(StratumError::NotFound(_))));
        assert!(store.remove("app:latest").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_deletes_unshared_layers() {
        let tmp = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let store = open(tmp.path());

        let upper = |name: &str, file: &str| {
            let dir = work.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(file), name).unwrap();
            store.layers.register_layer_for_builder(&dir).unwrap().unwrap()
        };
        let shared = upper("shared", "base");
        let own = upper("own", "app");

        let base = Image::new(
            "",
            vec![
                Layer::from_base(SCRATCH),
                Layer::new(LayerKind::Copy, "base /").with_id(Some(shared.clone())),
            ],
        );
        let mut app = base.clone();
        app.layers
            .push(Layer::new(LayerKind::Copy, "app /").with_id(Some(own.clone())));
        store.save(&base, "base:v1").await.unwrap();
        store.save(&app, "app:v1").await.unwrap();

        store.remove("app:v1").await.unwrap();
        assert!(!store.layers.contains(&own));
        assert!(store.layers.contains(&shared));

        store.remove("base:v1").await.unwrap();
        assert!(store.layers.layers().is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_blobs() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path());
        store.save(&image(), "a").await.unwrap();
        store.content.put(b"not json").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }
}
