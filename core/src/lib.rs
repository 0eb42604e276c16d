//! Stratum Core - Foundational Types
//!
//! Error type, configuration, content digests, the image/layer model and
//! build events shared by the builder and the CLI.

pub mod config;
pub mod digest;
pub mod error;
pub mod event;
pub mod image;

// Re-export commonly used types
pub use config::{BuildMode, BuilderConfig, MountDriverKind};
pub use digest::Digest;
pub use error::{Result, StratumError};
pub use event::{BuildEvent, EventEmitter};
pub use image::{Image, Layer, LayerKind, MAX_LAYER_DEPTH, ROOTFS_CACHE_VALUE, SCRATCH};

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
