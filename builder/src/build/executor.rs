//! Instruction executor.
//!
//! Runs one decoded layer through PreHandle, CacheCheck, Mount, Execute,
//! Register and PersistCacheMetadata, returning the layer with its id and
//! the cursor for the next step.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use stratum_core::error::{Result, StratumError};
use stratum_core::event::events;
use stratum_core::{BuildEvent, BuildMode, Digest, EventEmitter, Layer, LayerKind};

use super::collaborators::{format_images, CommandRunner, ImageMirror, REGISTRY_DIR};
use crate::cache::{self, CacheCursor, CacheLayer, ChainIndex, Probe};
use crate::fs::copy_entry;
use crate::mount::MountEngine;
use crate::store::{LayerStore, META_CACHE_ID};

/// File name whose COPY triggers mirroring of the images it lists.
const IMAGE_LIST_FILE: &str = "imageList";

/// A layer decoded into what it asks the executor to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From { reference: String },
    Copy { src: String, dest: String },
    Run { command: String },
    Cmd { command: String },
    /// Synthetic rootfs layer; never executed.
    Base,
}

impl Instruction {
    pub fn decode(layer: &Layer) -> Result<Self> {
        let value = layer.value.trim();
        Ok(match layer.kind {
            LayerKind::From => Instruction::From {
                reference: value.to_string(),
            },
            LayerKind::Copy => {
                let parts: Vec<&str> = value.split_whitespace().collect();
                match parts.as_slice() {
                    [src, dest] => Instruction::Copy {
                        src: src.to_string(),
                        dest: dest.to_string(),
                    },
                    _ => {
                        return Err(StratumError::Config(format!(
                            "COPY expects 'src dest', got '{}'",
                            value
                        )));
                    }
                }
            }
            LayerKind::Run => Instruction::Run {
                command: value.to_string(),
            },
            LayerKind::Cmd => Instruction::Cmd {
                command: value.to_string(),
            },
            LayerKind::Base => Instruction::Base,
        })
    }
}

/// What a step needs to know about the build it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// 1-based position among the new layers, for logs and events
    pub step: usize,
    pub context_dir: &'a Path,
    /// Target of the outer build mount
    pub rootfs: &'a Path,
    /// Layer directories the step runs on, lowest first
    pub base_stack: &'a [PathBuf],
    pub cursor: &'a CacheCursor,
}

/// Result of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// The input layer with its id assigned (if it produced content)
    pub layer: Layer,
    pub cursor: CacheCursor,
    pub cache_hit: bool,
    /// Whether the step executed and produced a layer
    pub registered: bool,
}

/// Executes build steps. Cheap to share; holds only handles.
pub struct Executor {
    mounts: MountEngine,
    layers: Arc<LayerStore>,
    chains: Arc<ChainIndex>,
    runner: Arc<dyn CommandRunner>,
    mirror: Arc<dyn ImageMirror>,
    events: EventEmitter,
    mode: BuildMode,
}

impl Executor {
    pub fn new(
        mounts: MountEngine,
        layers: Arc<LayerStore>,
        chains: Arc<ChainIndex>,
        runner: Arc<dyn CommandRunner>,
        mirror: Arc<dyn ImageMirror>,
        events: EventEmitter,
        mode: BuildMode,
    ) -> Self {
        Self {
            mounts,
            layers,
            chains,
            runner,
            mirror,
            events,
            mode,
        }
    }

    /// Run one layer.
    pub async fn execute(&self, layer: &Layer, ctx: StepContext<'_>) -> Result<StepOutcome> {
        let instruction = Instruction::decode(layer)?;

        let src = match &instruction {
            Instruction::From { .. } => {
                return Err(StratumError::Config(format!(
                    "step {}: FROM is only valid as the first instruction",
                    ctx.step
                )));
            }
            Instruction::Base => {
                return Err(StratumError::Config(format!(
                    "step {}: rootfs layers cannot be built from instructions",
                    ctx.step
                )));
            }
            Instruction::Cmd { .. } if self.mode == BuildMode::Lite => {
                tracing::debug!(step = ctx.step, value = %layer.value, "Lite build, skipping CMD");
                return Ok(StepOutcome {
                    layer: layer.clone(),
                    cursor: ctx.cursor.fold(&CacheLayer::new(layer, None))?,
                    cache_hit: false,
                    registered: false,
                });
            }
            Instruction::Copy { src, .. } => Some(src.as_str()),
            Instruction::Run { .. } | Instruction::Cmd { .. } => None,
        };

        tracing::info!(step = ctx.step, kind = %layer.kind, value = %layer.value, "Running build step");
        self.events.emit(BuildEvent::with_fields(
            events::STEP_STARTED,
            [
                ("step", serde_json::json!(ctx.step)),
                ("kind", serde_json::json!(layer.kind.as_str())),
                ("value", serde_json::json!(layer.value)),
            ],
        ));

        // PreHandle
        if let Some(src) = src {
            self.pre_handle(src, ctx).await?;
        }

        // CacheCheck
        let cache_id = src.and_then(|src| cache::source_digest(ctx.context_dir, src));
        let cache = CacheLayer::new(layer, cache_id.clone());
        let next = if ctx.cursor.enabled {
            match self.chains.probe(ctx.cursor.parent.as_ref(), &cache) {
                Ok(Probe::Hit {
                    layer_id: Some(id),
                    chain_id,
                }) if !self.layers.contains(&id) => {
                    tracing::warn!(step = ctx.step, layer = %id, "Cached layer is gone, rebuilding");
                    ctx.cursor.advance(chain_id, false)
                }
                Ok(Probe::Hit { layer_id, chain_id }) => {
                    tracing::info!(step = ctx.step, chain = %chain_id, "Cache hit");
                    self.events.emit(BuildEvent::with_fields(
                        events::STEP_CACHE_HIT,
                        [
                            ("step", serde_json::json!(ctx.step)),
                            ("chain_id", serde_json::json!(chain_id.to_string())),
                        ],
                    ));
                    return Ok(StepOutcome {
                        layer: layer.clone().with_id(layer_id),
                        cursor: ctx.cursor.advance(chain_id, true),
                        cache_hit: true,
                        registered: false,
                    });
                }
                Ok(Probe::Miss { chain_id }) => {
                    tracing::debug!(step = ctx.step, chain = %chain_id, "Cache miss");
                    ctx.cursor.advance(chain_id, false)
                }
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(step = ctx.step, error = %e, "Cache probe failed, treating as miss");
                    ctx.cursor.fold(&cache)?.disabled()
                }
                Err(e) => return Err(e),
            }
        } else {
            ctx.cursor.fold(&cache)?
        };

        // Mount
        let mut mount = self.mounts.session(None, None, ctx.base_stack.to_vec())?;
        mount.mount()?;

        // Execute
        match &instruction {
            Instruction::Run { command } | Instruction::Cmd { command } => {
                self.runner.run(command, mount.target()).await?;
            }
            Instruction::Copy { src, dest } => {
                copy_sources(ctx.context_dir, src, dest, mount.target())?;
            }
            Instruction::From { .. } | Instruction::Base => {}
        }

        // Register
        if matches!(instruction, Instruction::Cmd { .. }) {
            mount.cleanup()?;
            return Ok(StepOutcome {
                layer: layer.clone(),
                cursor: next,
                cache_hit: false,
                registered: false,
            });
        }

        mount.seal()?;
        let layer_id = self.layers.register_layer_for_builder(mount.upper())?;
        mount.cleanup()?;

        match &layer_id {
            Some(id) => {
                self.events.emit(BuildEvent::with_fields(
                    events::LAYER_REGISTERED,
                    [
                        ("step", serde_json::json!(ctx.step)),
                        ("layer_id", serde_json::json!(id.to_string())),
                    ],
                ));
            }
            None => {
                tracing::info!(step = ctx.step, "Step produced no filesystem changes");
            }
        }

        // PersistCacheMetadata
        if let (Some(id), Some(cache_id)) = (&layer_id, &cache_id) {
            self.persist_cache_id(id, cache_id);
        }

        Ok(StepOutcome {
            registered: layer_id.is_some(),
            layer: layer.clone().with_id(layer_id),
            cursor: next,
            cache_hit: false,
        })
    }

    /// Mirror the images listed by a copied `imageList` into the rootfs
    /// registry before the copy runs.
    async fn pre_handle(&self, src: &str, ctx: StepContext<'_>) -> Result<()> {
        if Path::new(src).file_name().and_then(|n| n.to_str()) != Some(IMAGE_LIST_FILE) {
            return Ok(());
        }

        let mut images = Vec::new();
        for path in cache::resolve_sources(ctx.context_dir, src)? {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                StratumError::Config(format!(
                    "Failed to read image list {}: {}",
                    path.display(),
                    e
                ))
            })?;
            images.extend(text.lines().map(str::to_string));
        }

        let images = format_images(images);
        if images.is_empty() {
            return Ok(());
        }
        tracing::info!(step = ctx.step, count = images.len(), "Mirroring images from image list");
        self.mirror.mirror(&images, &ctx.rootfs.join(REGISTRY_DIR)).await
    }

    fn persist_cache_id(&self, layer_id: &Digest, cache_id: &Digest) {
        let content = self.layers.content();
        if let Err(e) = content.set_metadata(layer_id, META_CACHE_ID, cache_id.to_string().as_bytes()) {
            tracing::warn!(layer = %layer_id, error = %e, "Failed to persist cache id");
        }
    }
}

/// Map a COPY destination onto the view root.
pub fn map_destination(view: &Path, dest: &str) -> Result<PathBuf> {
    if matches!(dest, "." | "./" | "/") {
        return Ok(view.to_path_buf());
    }

    let relative = dest
        .strip_prefix("./")
        .or_else(|| dest.strip_prefix('/'))
        .unwrap_or(dest);
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(StratumError::Config(format!(
            "COPY destination '{}' escapes the build root",
            dest
        )));
    }
    Ok(view.join(relative))
}

/// Copy every match of `src` into `<dest>/<basename>` inside `view`.
pub fn copy_sources(context: &Path, src: &str, dest: &str, view: &Path) -> Result<()> {
    let dest_root = map_destination(view, dest)?;
    std::fs::create_dir_all(&dest_root).map_err(|e| {
        StratumError::Config(format!(
            "Failed to create COPY destination {}: {}",
            dest_root.display(),
            e
        ))
    })?;

    for source in cache::resolve_sources(context, src)? {
        let name = source.file_name().ok_or_else(|| {
            StratumError::Config(format!("COPY source {} has no file name", source.display()))
        })?;
        let target = dest_root.join(name);
        copy_entry(&source, &target).map_err(|e| {
            StratumError::Config(format!(
                "Failed to copy {} to {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })?;
        tracing::debug!(src = %source.display(), dest = %target.display(), "Copied");
    }
    Ok(())
}
