//! Integration tests: full builds through the pipeline with the copy driver.
//!
//! The copy driver needs no privileges, so these run anywhere `sh` exists.
//!
//! ```bash
//! cargo test -p stratum-builder --test build_pipeline
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use stratum_builder::build::LoggingMirror;
use stratum_builder::{BuildRequest, Builder, CopyDriver, MountEngine};
use stratum_core::event::events;
use stratum_core::{BuilderConfig, Layer, LayerKind, StratumError, MAX_LAYER_DEPTH, SCRATCH};
use tempfile::TempDir;

fn config(root: &Path) -> BuilderConfig {
    BuilderConfig::with_root(root.join("root"))
}

fn open(config: BuilderConfig) -> Builder {
    let mounts = MountEngine::new(Arc::new(CopyDriver::new()), &config.tmp_dir).unwrap();
    Builder::with_mounts(config, mounts).unwrap()
}

fn context(root: &Path) -> std::path::PathBuf {
    let ctx = root.join("ctx");
    fs::create_dir_all(&ctx).unwrap();
    fs::write(ctx.join("app.bin"), "binary v1").unwrap();
    ctx
}

fn app_layers() -> Vec<Layer> {
    vec![
        Layer::from_base(SCRATCH),
        Layer::new(LayerKind::Copy, "app.bin /bin/app"),
        Layer::new(LayerKind::Run, "chmod +x bin/app"),
    ]
}

fn tmp_entries(builder: &Builder) -> usize {
    fs::read_dir(&builder.config().tmp_dir).unwrap().count()
}

// --- End to end ---

#[tokio::test]
async fn test_build_and_rebuild_hits_cache() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));

    let first = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
        .await
        .unwrap();

    assert_eq!(first.layers.len(), 3);
    assert_eq!(first.layers[0], Layer::from_base(SCRATCH));
    assert!(first.layers[1..].iter().all(|l| l.id.is_some()));
    assert_eq!(first.new_layers, 2);
    assert_eq!(first.cache_hits, 0);

    let copy_id = first.layers[1].id.clone().unwrap();
    assert_eq!(
        fs::read_to_string(builder.layers().layer_dir(&copy_id).join("bin/app/app.bin")).unwrap(),
        "binary v1"
    );
    let stored_layers = builder.layers().layers().len();

    let second = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
        .await
        .unwrap();

    assert_eq!(second.cache_hits, 2);
    assert_eq!(second.new_layers, 0);
    assert_eq!(second.layers, first.layers);
    assert_eq!(second.image_id, first.image_id);
    assert_eq!(builder.layers().layers().len(), stored_layers);
    assert_eq!(tmp_entries(&builder), 0);
}

#[tokio::test]
async fn test_restore_after_reopen() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());

    let first = {
        let builder = open(config(tmp.path()));
        builder
            .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
            .await
            .unwrap()
    };

    let builder = open(config(tmp.path()));
    assert!(builder.restore().unwrap() > 0);
    assert_eq!(builder.restore().unwrap(), 0);

    let again = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v2"))
        .await
        .unwrap();
    assert_eq!(again.cache_hits, 2);
    assert_eq!(again.layers, first.layers);
    assert_ne!(again.image_id, first.image_id);
}

// --- Invalidation ---

#[tokio::test]
async fn test_copy_change_invalidates_rest_of_build() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));

    let first = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
        .await
        .unwrap();

    fs::write(ctx.join("app.bin"), "binary v2").unwrap();
    let changed = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v2"))
        .await
        .unwrap();

    assert_eq!(changed.cache_hits, 0);
    assert_ne!(changed.layers[1].id, first.layers[1].id);

    // The new sources are now cached too.
    let again = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v2"))
        .await
        .unwrap();
    assert_eq!(again.cache_hits, 2);
    assert_eq!(again.layers, changed.layers);
}

#[tokio::test]
async fn test_changed_later_step_keeps_earlier_hits() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));

    builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
        .await
        .unwrap();

    let mut layers = app_layers();
    layers[2] = Layer::new(LayerKind::Run, "echo changed > note");
    layers.push(Layer::new(LayerKind::Run, "chmod +x bin/app"));

    let result = builder
        .build(BuildRequest::new(&ctx, layers, "app:v3"))
        .await
        .unwrap();
    assert_eq!(result.cache_hits, 1);
    assert_eq!(result.layers.len(), 4);
}

#[tokio::test]
async fn test_no_cache_never_hits() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));
    builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
        .await
        .unwrap();
    drop(builder);

    let mut cfg = config(tmp.path());
    cfg.no_cache = true;
    let builder = open(cfg);
    let result = builder
        .build(BuildRequest::new(&ctx, app_layers(), "app:v1"))
        .await
        .unwrap();
    assert_eq!(result.cache_hits, 0);
}

// --- Layer cap ---

#[tokio::test]
async fn test_layer_cap_fails_before_mounting() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));

    let mut layers = vec![Layer::from_base(SCRATCH)];
    for i in 0..=MAX_LAYER_DEPTH {
        layers.push(Layer::new(LayerKind::Run, format!("echo {} > f{}", i, i)));
    }

    let err = builder
        .build(BuildRequest::new(&ctx, layers, "too-deep"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratumError::Config(_)));
    assert_eq!(tmp_entries(&builder), 0);
    assert!(builder.layers().layers().is_empty());
    assert!(builder.images().names().await.is_empty());
}

// --- Failure and cleanup ---

#[tokio::test]
async fn test_failed_step_persists_no_image() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));
    let mut rx = builder.events().subscribe();

    let mut layers = app_layers();
    layers[2] = Layer::new(LayerKind::Run, "exit 4");

    let err = builder
        .build(BuildRequest::new(&ctx, layers, "broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratumError::Execution { exit_code: 4, .. }));

    assert!(builder.images().names().await.is_empty());
    // The COPY layer survives for later builds.
    assert_eq!(builder.layers().layers().len(), 1);
    assert_eq!(tmp_entries(&builder), 0);

    let mut keys = Vec::new();
    while let Ok(event) = rx.try_recv() {
        keys.push(event.key);
    }
    assert_eq!(keys.first().map(String::as_str), Some(events::BUILD_STARTED));
    assert_eq!(keys.last().map(String::as_str), Some(events::BUILD_FAILED));
}

#[tokio::test]
async fn test_missing_copy_source_fails() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));

    let layers = vec![
        Layer::from_base(SCRATCH),
        Layer::new(LayerKind::Copy, "absent.txt /"),
    ];
    let err = builder
        .build(BuildRequest::new(&ctx, layers, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StratumError::NotFound(_)));
    assert_eq!(tmp_entries(&builder), 0);
}

// --- Merge precedence ---

#[tokio::test]
async fn test_later_layers_win() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    fs::create_dir_all(ctx.join("v1")).unwrap();
    fs::create_dir_all(ctx.join("v2")).unwrap();
    fs::write(ctx.join("v1/conf"), "one").unwrap();
    fs::write(ctx.join("v2/conf"), "two").unwrap();
    let builder = open(config(tmp.path()));

    let layers = vec![
        Layer::from_base(SCRATCH),
        Layer::new(LayerKind::Copy, "v1/conf /etc"),
        Layer::new(LayerKind::Copy, "v2/conf /etc"),
        Layer::new(LayerKind::Run, "cat etc/conf > seen"),
    ];
    let result = builder
        .build(BuildRequest::new(&ctx, layers, "merge"))
        .await
        .unwrap();

    let run_id = result.layers[3].id.clone().unwrap();
    assert_eq!(
        fs::read_to_string(builder.layers().layer_dir(&run_id).join("seen")).unwrap(),
        "two"
    );
}

// --- Base images ---

#[tokio::test]
async fn test_derived_image_reuses_base_cache() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let builder = open(config(tmp.path()));

    builder
        .build(BuildRequest::new(&ctx, app_layers(), "base:v1"))
        .await
        .unwrap();

    let derived = vec![
        Layer::from_base("base:v1"),
        Layer::new(LayerKind::Run, "ls bin/app > listing"),
    ];
    let first = builder
        .build(BuildRequest::new(&ctx, derived.clone(), "app:v1"))
        .await
        .unwrap();
    assert_eq!(first.layers.len(), 4);
    let listing = first.layers[3].id.clone().unwrap();
    assert_eq!(
        fs::read_to_string(builder.layers().layer_dir(&listing).join("listing")).unwrap(),
        "app.bin\n"
    );

    let second = builder
        .build(BuildRequest::new(&ctx, derived, "app:v1"))
        .await
        .unwrap();
    assert_eq!(second.cache_hits, 1);
}

// --- Lite builds ---

#[tokio::test]
async fn test_lite_build_skips_cmd() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let mut cfg = config(tmp.path());
    cfg.build_mode = stratum_core::BuildMode::Lite;
    let builder = open(cfg);

    let mut layers = app_layers();
    layers.insert(2, Layer::new(LayerKind::Cmd, "exit 9"));

    let first = builder
        .build(BuildRequest::new(&ctx, layers.clone(), "lite"))
        .await
        .unwrap();
    assert_eq!(first.layers.len(), 4);
    assert!(first.layers[2].id.is_none());

    let second = builder
        .build(BuildRequest::new(&ctx, layers, "lite"))
        .await
        .unwrap();
    // COPY and RUN hit; the skipped CMD is neither hit nor run.
    assert_eq!(second.cache_hits, 2);
}

// --- Image lists ---

#[tokio::test]
async fn test_image_list_is_mirrored() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    fs::write(ctx.join("imageList"), "nginx:1.25\n# pinned\nredis:7\n").unwrap();

    let mirror = Arc::new(LoggingMirror::new());
    let builder = open(config(tmp.path())).with_mirror(mirror.clone());

    let layers = vec![
        Layer::from_base(SCRATCH),
        Layer::new(LayerKind::Copy, "imageList manifests"),
    ];
    builder
        .build(BuildRequest::new(&ctx, layers, "with-images"))
        .await
        .unwrap();

    let requested = mirror.requested();
    assert!(requested.contains(&"nginx:1.25".to_string()));
    assert!(requested.contains(&"redis:7".to_string()));
    assert!(!requested.iter().any(|i| i.starts_with('#')));
}
