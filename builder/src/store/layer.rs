//! Content-addressed layer store.
//!
//! A layer is a plain directory under `layers/<hex>/`, directly usable as an
//! overlay lower. Its id is the digest of the canonical tar of that
//! directory; `id` and `size` are recorded as layer metadata in the content
//! store so the set of layers can be rebuilt on open.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use stratum_core::error::{Result, StratumError};
use stratum_core::Digest;

use crate::archive;
use crate::fs::move_dir;
use crate::store::content::{ContentStore, META_ID, META_SIZE};

/// A registered, read-only layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoLayer {
    pub id: Digest,
    /// Canonical tar size in bytes
    pub size: u64,
}

/// Registry of layer directories.
pub struct LayerStore {
    layers_dir: PathBuf,
    content: Arc<dyn ContentStore>,
    layers: RwLock<HashMap<Digest, RoLayer>>,
}

impl LayerStore {
    /// Open the store, loading every layer that has valid `id` metadata.
    pub fn open(root: &Path, content: Arc<dyn ContentStore>) -> Result<Self> {
        let layers_dir = root.join("layers");
        std::fs::create_dir_all(&layers_dir).map_err(|e| {
            StratumError::Store(format!(
                "Failed to create layer directory {}: {}",
                layers_dir.display(),
                e
            ))
        })?;

        let store = Self {
            layers_dir,
            content,
            layers: RwLock::new(HashMap::new()),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let mut loaded = HashMap::new();
        for candidate in self.content.metadata_layers()? {
            match self.read_layer(&candidate) {
                Ok(layer) => {
                    loaded.insert(layer.id.clone(), layer);
                }
                Err(e) => {
                    tracing::warn!(layer = %candidate, error = %e, "Skipping layer with invalid metadata");
                }
            }
        }

        tracing::debug!(count = loaded.len(), "Loaded layers");
        *self.layers.write() = loaded;
        Ok(())
    }

    fn read_layer(&self, candidate: &Digest) -> Result<RoLayer> {
        let raw = self.content.get_metadata(candidate, META_ID)?;
        let id = Digest::parse(&String::from_utf8_lossy(&raw))?;
        if &id != candidate {
            return Err(StratumError::Store(format!(
                "id metadata {} does not match entry {}",
                id, candidate
            )));
        }
        if !self.layer_dir(&id).is_dir() {
            return Err(StratumError::NotFound(format!("layer data for {}", id)));
        }

        let size = self
            .content
            .get_metadata(&id, META_SIZE)
            .ok()
            .and_then(|raw| String::from_utf8_lossy(&raw).trim().parse().ok())
            .unwrap_or(0);

        Ok(RoLayer { id, size })
    }

    /// Directory holding a layer's files.
    pub fn layer_dir(&self, id: &Digest) -> PathBuf {
        self.layers_dir.join(id.hex())
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn get(&self, id: &Digest) -> Option<RoLayer> {
        self.layers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &Digest) -> bool {
        self.layers.read().contains_key(id)
    }

    /// All registered layers, sorted by id.
    pub fn layers(&self) -> Vec<RoLayer> {
        let mut layers: Vec<_> = self.layers.read().values().cloned().collect();
        layers.sort_by(|a, b| a.id.cmp(&b.id));
        layers
    }

    /// Register a directory produced by a build step.
    ///
    /// Returns `None` for an empty directory. When the layer already exists
    /// the directory is left where it is; otherwise it is moved into the
    /// store.
    pub fn register_layer_for_builder(&self, dir: &Path) -> Result<Option<Digest>> {
        let (id, size) = match archive::canonical_digest(dir)? {
            Some(found) => found,
            None => {
                tracing::debug!(dir = %dir.display(), "Empty directory, no layer registered");
                return Ok(None);
            }
        };

        if self.contains(&id) {
            tracing::debug!(layer = %id, "Layer already registered");
            return Ok(Some(id));
        }

        self.publish(dir, RoLayer { id: id.clone(), size })?;
        Ok(Some(id))
    }

    /// Register a layer arriving as a tar stream whose digest must be `layer.id`.
    pub fn register_layer_if_not_present<R: Read>(&self, layer: RoLayer, reader: R) -> Result<()> {
        if self.contains(&layer.id) {
            tracing::debug!(layer = %layer.id, "Layer already present, skipping pull");
            return Ok(());
        }

        let staging = tempfile::Builder::new()
            .prefix(".pull-")
            .tempdir_in(&self.layers_dir)
            .map_err(|e| {
                StratumError::Registration(format!("Failed to create staging dir: {}", e))
            })?;

        let (digest, read) = archive::unpack_hashed(reader, staging.path())?;
        if digest != layer.id {
            return Err(StratumError::Registration(format!(
                "layer stream digest {} does not match expected {}",
                digest, layer.id
            )));
        }

        let size = if layer.size == 0 { read } else { layer.size };
        self.publish(staging.path(), RoLayer { id: layer.id, size })?;
        Ok(())
    }

    fn publish(&self, dir: &Path, layer: RoLayer) -> Result<()> {
        let dest = self.layer_dir(&layer.id);
        if dest.exists() {
            // Data without metadata: left behind by an interrupted registration.
            std::fs::remove_dir_all(&dest).map_err(|e| {
                StratumError::Registration(format!(
                    "Failed to clear stale layer dir {}: {}",
                    dest.display(),
                    e
                ))
            })?;
        }

        move_dir(dir, &dest).map_err(|e| {
            StratumError::Registration(format!(
                "Failed to move {} to {}: {}",
                dir.display(),
                dest.display(),
                e
            ))
        })?;

        self.content
            .set_metadata(&layer.id, META_SIZE, layer.size.to_string().as_bytes())?;
        self.content
            .set_metadata(&layer.id, META_ID, layer.id.to_string().as_bytes())?;

        tracing::info!(layer = %layer.id, size = layer.size, "Registered layer");
        self.layers.write().insert(layer.id.clone(), layer);
        Ok(())
    }

    /// Remove a layer's data and metadata.
    pub fn delete(&self, id: &Digest) -> Result<()> {
        if self.layers.write().remove(id).is_none() {
            return Err(StratumError::NotFound(format!("layer {}", id)));
        }

        self.content.delete_metadata(id)?;
        let dir = self.layer_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                StratumError::Store(format!(
                    "Failed to remove layer dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        tracing::debug!(layer = %id, "Deleted layer");
        Ok(())
    }
}
