//! Stratum builder - layered image build and cache engine.
//!
//! Content-addressed stores for blobs, layers and images, a mount engine
//! producing merged views, the chain index that lets unchanged instruction
//! sequences skip execution, and the build pipeline on top of them.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod build;
pub mod cache;
pub mod fs;
pub mod mount;
pub mod store;

// Re-export common types
pub use build::{
    BuildRequest, BuildResult, Builder, Buildfile, CommandRunner, Differ, ImageMirror, ImagePuller,
    Instruction,
};
pub use cache::{CacheCursor, CacheLayer, ChainId, ChainIndex, Probe};
pub use mount::{CopyDriver, MountDriver, MountEngine, MountTarget, OverlayDriver};
pub use store::{ContentStore, FsContentStore, ImageMetadata, ImageStore, LayerStore, RoLayer};

/// Stratum builder version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
