//! Build pipeline.
//!
//! Resolves the base image, runs every new layer through the executor in
//! order, runs the differs, registers the rootfs delta and persists the
//! resulting image.
//!
//! # Process
//!
//! 1. Resolve the base (`scratch` or a stored image)
//! 2. Check the layer cap before anything is mounted
//! 3. Mount the base stack as the build rootfs
//! 4. Execute each new layer, growing the stack as layers are produced
//! 5. Run the differs over the new layers
//! 6. Register the rootfs upper as a trailing `BASE` layer
//! 7. Save the image and index its chains

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use stratum_core::error::{Result, StratumError};
use stratum_core::event::events;
use stratum_core::{
    BuildEvent, BuilderConfig, Digest, EventEmitter, Image, Layer, LayerKind, MAX_LAYER_DEPTH,
    SCRATCH,
};

use super::buildfile::Buildfile;
use super::collaborators::{
    CommandRunner, ImageMirror, ImagePuller, LocalPuller, LoggingMirror, ShellRunner,
};
use super::differ::{run_differs, Differ, ImageListDiffer};
use super::executor::{Executor, StepContext};
use crate::cache::chain::persisted_cache_layer;
use crate::cache::{CacheCursor, CacheLayer, ChainIndex};
use crate::mount::MountEngine;
use crate::store::{ContentStore, FsContentStore, ImageStore, LayerStore};

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory COPY sources are resolved in
    pub context_dir: PathBuf,
    /// Decoded layers; the first must be FROM
    pub layers: Vec<Layer>,
    /// Name to store the image under
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

impl BuildRequest {
    pub fn new(context_dir: impl Into<PathBuf>, layers: Vec<Layer>, name: impl Into<String>) -> Self {
        Self {
            context_dir: context_dir.into(),
            layers,
            name: name.into(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn from_buildfile(
        context_dir: impl Into<PathBuf>,
        buildfile: Buildfile,
        name: impl Into<String>,
    ) -> Self {
        Self::new(context_dir, buildfile.layers, name)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_id: Digest,
    pub name: String,
    /// Every layer of the stored image
    pub layers: Vec<Layer>,
    /// Layers registered by executing steps (rootfs layer included)
    pub new_layers: usize,
    /// Steps answered from the cache
    pub cache_hits: usize,
}

/// The build engine: stores, chain index, mounts and collaborators.
pub struct Builder {
    config: BuilderConfig,
    content: Arc<dyn ContentStore>,
    layers: Arc<LayerStore>,
    images: Arc<ImageStore>,
    chains: Arc<ChainIndex>,
    mounts: MountEngine,
    puller: Arc<dyn ImagePuller>,
    runner: Arc<dyn CommandRunner>,
    mirror: Arc<dyn ImageMirror>,
    differs: Vec<Arc<dyn Differ>>,
    events: EventEmitter,
}

impl Builder {
    /// Open the stores under the configured root and probe the mount driver.
    pub fn open(config: BuilderConfig) -> Result<Self> {
        let mounts = MountEngine::probe(config.mount_driver, &config.tmp_dir)?;
        match mounts.clean_leftovers() {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "Cleaned up mounts left by a previous run"),
            Err(e) => tracing::warn!(error = %e, "Failed to check for leftover mounts"),
        }
        Self::with_mounts(config, mounts)
    }

    /// Open the stores with an explicit mount engine.
    pub fn with_mounts(config: BuilderConfig, mounts: MountEngine) -> Result<Self> {
        config.ensure_dirs()?;
        let content: Arc<dyn ContentStore> = Arc::new(FsContentStore::open(&config.root_dir)?);
        let layers = Arc::new(LayerStore::open(&config.root_dir, content.clone())?);
        let images = Arc::new(ImageStore::open(
            &config.root_dir,
            content.clone(),
            layers.clone(),
        )?);
        let mirror: Arc<dyn ImageMirror> = Arc::new(LoggingMirror::new());

        tracing::info!(
            root = %config.root_dir.display(),
            driver = mounts.driver().name(),
            mode = %config.build_mode,
            "Builder opened"
        );

        Ok(Self {
            puller: Arc::new(LocalPuller::new(images.clone())),
            runner: Arc::new(ShellRunner),
            differs: vec![Arc::new(ImageListDiffer::new(mirror.clone()))],
            mirror,
            chains: Arc::new(ChainIndex::new()),
            events: EventEmitter::default(),
            config,
            content,
            layers,
            images,
            mounts,
        })
    }

    pub fn with_puller(mut self, puller: Arc<dyn ImagePuller>) -> Self {
        self.puller = puller;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the mirror; the default image list differ follows it.
    pub fn with_mirror(mut self, mirror: Arc<dyn ImageMirror>) -> Self {
        self.differs = vec![Arc::new(ImageListDiffer::new(mirror.clone()))];
        self.mirror = mirror;
        self
    }

    pub fn with_differs(mut self, differs: Vec<Arc<dyn Differ>>) -> Self {
        self.differs = differs;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    pub fn chains(&self) -> &Arc<ChainIndex> {
        &self.chains
    }

    pub fn mounts(&self) -> &MountEngine {
        &self.mounts
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Index the chains of every stored image. Only the first call does work.
    pub fn restore(&self) -> Result<usize> {
        if self.chains.is_restored() {
            return Ok(0);
        }
        let images = self.images.list()?;
        Ok(self.chains.restore(&images, self.content.as_ref()))
    }

    /// Build and store an image.
    pub async fn build(&self, request: BuildRequest) -> Result<BuildResult> {
        self.events.emit(BuildEvent::with_fields(
            events::BUILD_STARTED,
            [("name", serde_json::json!(request.name))],
        ));

        match self.run_build(request).await {
            Ok(result) => {
                tracing::info!(
                    image = %result.name,
                    id = %result.image_id,
                    new_layers = result.new_layers,
                    cache_hits = result.cache_hits,
                    "Build completed"
                );
                self.events.emit(BuildEvent::with_fields(
                    events::BUILD_COMPLETED,
                    [
                        ("name", serde_json::json!(result.name)),
                        ("image_id", serde_json::json!(result.image_id.to_string())),
                    ],
                ));
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %e, "Build failed");
                self.events
                    .emit(BuildEvent::with_string(events::BUILD_FAILED, e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_build(&self, request: BuildRequest) -> Result<BuildResult> {
        self.restore()?;

        let (from, new_layers) = match request.layers.split_first() {
            Some((from, rest)) if from.kind == LayerKind::From => (from, rest),
            _ => {
                return Err(StratumError::Config(
                    "the first layer of a build must be FROM".to_string(),
                ));
            }
        };
        let reference = from.value.trim().to_string();

        let base_layers = self.resolve_base(&reference).await?;
        if base_layers.len() + new_layers.len() > MAX_LAYER_DEPTH {
            return Err(StratumError::Config(format!(
                "image would have {} layers, more than the limit of {}",
                base_layers.len() + new_layers.len(),
                MAX_LAYER_DEPTH
            )));
        }

        let from = Layer::from_base(reference.as_str());
        let mut cursor = self.start_cursor(&from, &base_layers)?;
        let mut stack: Vec<PathBuf> = base_layers
            .iter()
            .filter_map(|l| l.id.as_ref())
            .map(|id| self.layers.layer_dir(id))
            .collect();

        let mut rootfs = self.mounts.session(None, None, stack.clone())?;
        rootfs.mount()?;

        let executor = Executor::new(
            self.mounts.clone(),
            self.layers.clone(),
            self.chains.clone(),
            self.runner.clone(),
            self.mirror.clone(),
            self.events.clone(),
            self.config.build_mode,
        );

        let mut built = Vec::with_capacity(new_layers.len());
        let mut new_count = 0;
        let mut cache_hits = 0;
        for (idx, layer) in new_layers.iter().enumerate() {
            let outcome = executor
                .execute(
                    layer,
                    StepContext {
                        step: idx + 1,
                        context_dir: &request.context_dir,
                        rootfs: rootfs.target(),
                        base_stack: &stack,
                        cursor: &cursor,
                    },
                )
                .await?;

            if let Some(id) = &outcome.layer.id {
                stack.push(self.layers.layer_dir(id));
            }
            if outcome.cache_hit {
                cache_hits += 1;
            }
            if outcome.registered {
                new_count += 1;
            }
            cursor = outcome.cursor;
            built.push(outcome.layer);
        }
        tracing::info!(steps = built.len(), "All build steps done");

        // Differs read the new layers only.
        let new_dirs: Vec<PathBuf> = built
            .iter()
            .filter_map(|l| l.id.as_ref())
            .map(|id| self.layers.layer_dir(id))
            .collect();
        let mut view = self.mounts.session(None, None, new_dirs)?;
        view.mount()?;
        run_differs(&self.differs, view.target(), rootfs.target()).await?;
        view.cleanup()?;

        rootfs.seal()?;
        let rootfs_layer = self.layers.register_layer_for_builder(rootfs.upper())?;
        rootfs.cleanup()?;

        let mut layers = Vec::with_capacity(1 + base_layers.len() + built.len() + 1);
        layers.push(from);
        layers.extend(base_layers);
        layers.extend(built);
        match rootfs_layer {
            Some(id) => {
                new_count += 1;
                layers.push(Layer::rootfs(id));
            }
            None => tracing::debug!("No rootfs changes"),
        }

        let mut image = Image::new(request.name.as_str(), layers);
        image.annotations = request.annotations;
        let image_id = self.images.save(&image, &request.name).await?;
        image.id = Some(image_id.clone());
        self.chains.insert_image(&image, self.content.as_ref());

        Ok(BuildResult {
            image_id,
            name: request.name,
            layers: image.layers,
            new_layers: new_count,
            cache_hits,
        })
    }

    /// Content layers of the base image, verified to be present locally.
    async fn resolve_base(&self, reference: &str) -> Result<Vec<Layer>> {
        if reference == SCRATCH {
            return Ok(Vec::new());
        }

        self.puller.pull_if_not_exist(reference).await?;
        let base = self.images.get_by_name(reference).await?;

        let layers: Vec<Layer> = base.content_layers().cloned().collect();
        for layer in &layers {
            if let Some(id) = &layer.id {
                if !self.layers.contains(id) {
                    return Err(StratumError::NotFound(format!(
                        "layer {} of base image '{}'",
                        id, reference
                    )));
                }
            }
        }
        tracing::debug!(base = reference, layers = layers.len(), "Resolved base image");
        Ok(layers)
    }

    /// Cursor positioned after `[FROM base, base content layers...]`, the
    /// same prefix the chain index sees for images built on this base.
    ///
    /// The index stops at the first base layer without a projection, so the
    /// cursor starts disabled past that point.
    fn start_cursor(&self, from: &Layer, base_layers: &[Layer]) -> Result<CacheCursor> {
        let mut prefix = vec![CacheLayer::new(from, None)];
        for layer in base_layers {
            match persisted_cache_layer(layer, self.content.as_ref()) {
                Ok(cache) => prefix.push(cache),
                Err(e) => {
                    tracing::warn!(
                        value = %layer.value,
                        error = %e,
                        "Base layer has no cache projection, cache disabled for this build"
                    );
                    return CacheCursor::starting_at(&prefix, false);
                }
            }
        }
        CacheCursor::starting_at(&prefix, !self.config.no_cache)
    }
}
