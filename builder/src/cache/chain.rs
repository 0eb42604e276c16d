//! Chain identities and the index of known layer chains.
//!
//! A ChainID identifies "this exact sequence of instructions on top of this
//! exact parent". It folds the parent ChainID with a projection of one
//! layer: its kind, its trimmed value and, for COPY, the digest of the copied
//! sources. Equal ChainIDs mean an equal filesystem, so a hit lets a build
//! reuse the layer instead of running the instruction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use stratum_core::error::{Result, StratumError};
use stratum_core::{Digest, Image, Layer, LayerKind};

use crate::store::content::{ContentStore, META_CACHE_ID};

/// Identity of a layer prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(Digest);

impl ChainId {
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The part of a layer that takes part in its ChainID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheLayer {
    #[serde(rename = "type")]
    pub kind: LayerKind,
    pub value: String,
    #[serde(rename = "cacheID", skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<Digest>,
}

impl CacheLayer {
    /// Projection of `layer`. `cache_id` is only kept for COPY.
    pub fn new(layer: &Layer, cache_id: Option<Digest>) -> Self {
        Self {
            kind: layer.kind,
            value: layer.value.trim().to_string(),
            cache_id: if layer.kind == LayerKind::Copy {
                cache_id
            } else {
                None
            },
        }
    }

    /// Fold this projection onto `parent` (`None` is the empty root).
    pub fn chain_id(&self, parent: Option<&ChainId>) -> Result<ChainId> {
        let projection = serde_json::to_vec(self)
            .map_err(|e| StratumError::CacheProbe(format!("Failed to encode cache layer: {}", e)))?;

        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update(&projection);
        Ok(ChainId(Digest::from_sha256(hasher)))
    }

    fn matches(&self, other: &CacheLayer) -> bool {
        self.kind == other.kind
            && self.value == other.value
            && self.cache_id.is_some() == other.cache_id.is_some()
    }
}

/// ChainID of a whole layer sequence, from the root.
pub fn fold_chain<'a, I>(layers: I) -> Result<Option<ChainId>>
where
    I: IntoIterator<Item = &'a CacheLayer>,
{
    let mut parent = None;
    for layer in layers {
        parent = Some(layer.chain_id(parent.as_ref())?);
    }
    Ok(parent)
}

/// One indexed prefix.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    /// Layer as persisted, including its id
    pub layer: Layer,
    pub cache: CacheLayer,
    pub parent: Option<ChainId>,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Reuse `layer_id` (absent for instructions that produced no content).
    Hit {
        layer_id: Option<Digest>,
        chain_id: ChainId,
    },
    Miss { chain_id: ChainId },
}

impl Probe {
    pub fn chain_id(&self) -> &ChainId {
        match self {
            Probe::Hit { chain_id, .. } | Probe::Miss { chain_id } => chain_id,
        }
    }
}

#[derive(Default)]
struct ChainState {
    entries: HashMap<ChainId, ChainEntry>,
    children: HashMap<Option<ChainId>, Vec<ChainId>>,
}

impl ChainState {
    fn insert(&mut self, chain_id: ChainId, entry: ChainEntry) -> bool {
        if self.entries.contains_key(&chain_id) {
            return false;
        }
        self.children
            .entry(entry.parent.clone())
            .or_default()
            .push(chain_id.clone());
        self.entries.insert(chain_id, entry);
        true
    }
}

/// Every known layer chain, built from persisted images.
#[derive(Default)]
pub struct ChainIndex {
    state: RwLock<ChainState>,
    restored: AtomicBool,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every persisted image. Only the first call on an instance does
    /// any work; it returns the number of new entries.
    pub fn restore(&self, images: &[Image], content: &dyn ContentStore) -> usize {
        if self.restored.swap(true, Ordering::SeqCst) {
            tracing::debug!("Chain index already restored");
            return 0;
        }

        let mut state = self.state.write();
        let added: usize = images
            .iter()
            .map(|image| index_image(&mut state, image, content))
            .sum();

        tracing::info!(images = images.len(), chains = state.entries.len(), "Restored chain index");
        added
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    /// Add the chains of a freshly built image.
    pub fn insert_image(&self, image: &Image, content: &dyn ContentStore) -> usize {
        let mut state = self.state.write();
        index_image(&mut state, image, content)
    }

    /// Look `layer` up among the children of `parent`.
    pub fn probe(&self, parent: Option<&ChainId>, layer: &CacheLayer) -> Result<Probe> {
        let chain_id = layer.chain_id(parent)?;

        let state = self.state.read();
        let siblings = match state.children.get(&parent.cloned()) {
            Some(siblings) => siblings,
            None => return Ok(Probe::Miss { chain_id }),
        };

        for sibling in siblings {
            let entry = state.entries.get(sibling).ok_or_else(|| {
                StratumError::CacheProbe(format!("dangling chain {} in index", sibling))
            })?;
            if entry.cache.matches(layer) && sibling == &chain_id {
                return Ok(Probe::Hit {
                    layer_id: entry.layer.id.clone(),
                    chain_id,
                });
            }
        }

        Ok(Probe::Miss { chain_id })
    }

    pub fn get(&self, chain_id: &ChainId) -> Option<ChainEntry> {
        self.state.read().entries.get(chain_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `chain_id` as a child of `parent` without an entry.
    #[cfg(test)]
    pub(crate) fn insert_dangling(&self, parent: Option<ChainId>, chain_id: ChainId) {
        self.state.write().children.entry(parent).or_default().push(chain_id);
    }
}

/// Projection of a persisted layer; COPY layers need their cache-id metadata.
pub fn persisted_cache_layer(layer: &Layer, content: &dyn ContentStore) -> Result<CacheLayer> {
    if layer.kind != LayerKind::Copy {
        return Ok(CacheLayer::new(layer, None));
    }

    let id = layer.id.as_ref().ok_or_else(|| {
        StratumError::CacheProbe(format!("COPY layer '{}' has no id", layer.value))
    })?;
    let raw = content.get_metadata(id, META_CACHE_ID)?;
    let cache_id = Digest::parse(&String::from_utf8_lossy(&raw))?;
    Ok(CacheLayer::new(layer, Some(cache_id)))
}

fn index_image(state: &mut ChainState, image: &Image, content: &dyn ContentStore) -> usize {
    let mut parent: Option<ChainId> = None;
    let mut added = 0;

    for layer in &image.layers {
        let cache = match persisted_cache_layer(layer, content) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(
                    image = %image.name,
                    kind = %layer.kind,
                    value = %layer.value,
                    error = %e,
                    "Layer has no cache projection, indexing stops here"
                );
                break;
            }
        };

        let chain_id = match cache.chain_id(parent.as_ref()) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(image = %image.name, error = %e, "Failed to compute chain id");
                break;
            }
        };

        let entry = ChainEntry {
            layer: layer.clone(),
            cache,
            parent: parent.clone(),
        };
        if state.insert(chain_id.clone(), entry) {
            added += 1;
        }
        parent = Some(chain_id);
    }

    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::content::FsContentStore;
    use stratum_core::SCRATCH;
    use tempfile::TempDir;

    fn copy_layer(value: &str, id: &Digest) -> Layer {
        Layer::new(LayerKind::Copy, value).with_id(Some(id.clone()))
    }

    fn store() -> (TempDir, FsContentStore) {
        let tmp = TempDir::new().unwrap();
        let store = FsContentStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    // --- chain ids ---

    #[test]
    fn test_chain_id_deterministic() {
        let layer = CacheLayer::new(&Layer::new(LayerKind::Run, "make"), None);
        assert_eq!(layer.chain_id(None).unwrap(), layer.chain_id(None).unwrap());
    }

    #[test]
    fn test_chain_id_trims_value() {
        let a = CacheLayer::new(&Layer::new(LayerKind::Run, "  make all "), None);
        let b = CacheLayer::new(&Layer::new(LayerKind::Run, "make all"), None);
        assert_eq!(a.chain_id(None).unwrap(), b.chain_id(None).unwrap());
    }

    #[test]
    fn test_chain_id_depends_on_parent_kind_and_cache_id() {
        let run = CacheLayer::new(&Layer::new(LayerKind::Run, "x"), None);
        let cmd = CacheLayer::new(&Layer::new(LayerKind::Cmd, "x"), None);
        let root = run.chain_id(None).unwrap();
        assert_ne!(root, cmd.chain_id(None).unwrap());
        assert_ne!(root, run.chain_id(Some(&root)).unwrap());

        let copy = Layer::new(LayerKind::Copy, "a b");
        let c1 = CacheLayer::new(&copy, Some(Digest::from_bytes(b"v1")));
        let c2 = CacheLayer::new(&copy, Some(Digest::from_bytes(b"v2")));
        assert_ne!(c1.chain_id(None).unwrap(), c2.chain_id(None).unwrap());
    }

    #[test]
    fn test_cache_id_ignored_for_non_copy() {
        let layer = CacheLayer::new(
            &Layer::new(LayerKind::Run, "x"),
            Some(Digest::from_bytes(b"ignored")),
        );
        assert!(layer.cache_id.is_none());
    }

    #[test]
    fn test_fold_chain_matches_stepwise() {
        let a = CacheLayer::new(&Layer::from_base(SCRATCH), None);
        let b = CacheLayer::new(&Layer::new(LayerKind::Run, "x"), None);
        let step = b.chain_id(Some(&a.chain_id(None).unwrap())).unwrap();
        assert_eq!(fold_chain([&a, &b]).unwrap(), Some(step));
        assert_eq!(fold_chain(std::iter::empty::<&CacheLayer>()).unwrap(), None);
    }

    // --- index ---

    #[test]
    fn test_restore_then_probe_hits_every_prefix() {
        let (_tmp, content) = store();
        let layer_id = Digest::from_bytes(b"layer");
        let source = Digest::from_bytes(b"source");
        content
            .set_metadata(&layer_id, META_CACHE_ID, source.to_string().as_bytes())
            .unwrap();

        let run_id = Digest::from_bytes(b"run");
        let image = Image::new(
            "app",
            vec![
                Layer::from_base(SCRATCH),
                copy_layer("app.bin /bin/app", &layer_id),
                Layer::new(LayerKind::Run, "chmod +x bin/app").with_id(Some(run_id.clone())),
            ],
        );

        let index = ChainIndex::new();
        assert_eq!(index.restore(&[image.clone()], &content), 3);

        let from = CacheLayer::new(&image.layers[0], None);
        let root = match index.probe(None, &from).unwrap() {
            Probe::Hit { layer_id, chain_id } => {
                assert!(layer_id.is_none());
                chain_id
            }
            miss => panic!("expected hit, got {:?}", miss),
        };

        let copy = CacheLayer::new(&image.layers[1], Some(source));
        let probe = index.probe(Some(&root), &copy).unwrap();
        assert_eq!(
            probe,
            Probe::Hit {
                layer_id: Some(layer_id),
                chain_id: copy.chain_id(Some(&root)).unwrap(),
            }
        );

        let run = CacheLayer::new(&image.layers[2], None);
        match index.probe(Some(probe.chain_id()), &run).unwrap() {
            Probe::Hit { layer_id, .. } => assert_eq!(layer_id, Some(run_id)),
            miss => panic!("expected hit, got {:?}", miss),
        }
    }

    #[test]
    fn test_probe_misses_on_changed_source() {
        let (_tmp, content) = store();
        let layer_id = Digest::from_bytes(b"layer");
        content
            .set_metadata(&layer_id, META_CACHE_ID, Digest::from_bytes(b"old").to_string().as_bytes())
            .unwrap();
        let image = Image::new("app", vec![copy_layer("a /a", &layer_id)]);

        let index = ChainIndex::new();
        index.restore(&[image.clone()], &content);

        let changed = CacheLayer::new(&image.layers[0], Some(Digest::from_bytes(b"new")));
        let probe = index.probe(None, &changed).unwrap();
        assert_eq!(
            probe,
            Probe::Miss {
                chain_id: changed.chain_id(None).unwrap()
            }
        );
    }

    #[test]
    fn test_probe_copy_without_cache_id_misses() {
        let (_tmp, content) = store();
        let layer_id = Digest::from_bytes(b"layer");
        content
            .set_metadata(&layer_id, META_CACHE_ID, Digest::from_bytes(b"src").to_string().as_bytes())
            .unwrap();
        let image = Image::new("app", vec![copy_layer("a /a", &layer_id)]);
        let index = ChainIndex::new();
        index.restore(&[image.clone()], &content);

        let no_source = CacheLayer::new(&image.layers[0], None);
        assert!(matches!(
            index.probe(None, &no_source).unwrap(),
            Probe::Miss { .. }
        ));
    }

    #[test]
    fn test_restore_stops_at_copy_without_metadata() {
        let (_tmp, content) = store();
        let image = Image::new(
            "app",
            vec![
                Layer::from_base(SCRATCH),
                copy_layer("a /a", &Digest::from_bytes(b"no-meta")),
                Layer::new(LayerKind::Run, "ls -R > listing")
                    .with_id(Some(Digest::from_bytes(b"run-over-copy"))),
            ],
        );
        let index = ChainIndex::new();
        assert_eq!(index.restore(&[image.clone()], &content), 1);

        // A build without the COPY must not reuse the RUN built over it.
        let from = CacheLayer::new(&image.layers[0], None).chain_id(None).unwrap();
        let run = CacheLayer::new(&image.layers[2], None);
        assert!(matches!(
            index.probe(Some(&from), &run).unwrap(),
            Probe::Miss { .. }
        ));
    }

    #[test]
    fn test_probe_dangling_sibling_fails() {
        let index = ChainIndex::new();
        let run = CacheLayer::new(&Layer::new(LayerKind::Run, "x"), None);
        index.insert_dangling(None, run.chain_id(None).unwrap());

        let err = index.probe(None, &run).unwrap_err();
        assert!(matches!(err, StratumError::CacheProbe(_)));
    }

    #[test]
    fn test_restore_runs_once() {
        let (_tmp, content) = store();
        let image = Image::new("a", vec![Layer::from_base(SCRATCH)]);
        let index = ChainIndex::new();
        assert_eq!(index.restore(&[image.clone()], &content), 1);
        assert!(index.is_restored());

        let other = Image::new("b", vec![Layer::from_base("base:v1")]);
        assert_eq!(index.restore(&[other], &content), 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_insert_image_is_additive() {
        let (_tmp, content) = store();
        let index = ChainIndex::new();
        let image = Image::new(
            "a",
            vec![Layer::from_base(SCRATCH), Layer::new(LayerKind::Run, "x")],
        );
        assert_eq!(index.insert_image(&image, &content), 2);
        assert_eq!(index.insert_image(&image, &content), 0);

        let longer = Image::new(
            "b",
            vec![
                Layer::from_base(SCRATCH),
                Layer::new(LayerKind::Run, "x"),
                Layer::new(LayerKind::Run, "y"),
            ],
        );
        assert_eq!(index.insert_image(&longer, &content), 1);
        assert_eq!(index.len(), 3);
    }
}
