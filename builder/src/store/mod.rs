//! Persistent storage: blobs, layers and images.

pub mod content;
pub mod image;
pub mod layer;

pub use content::{ContentStore, FsContentStore, META_CACHE_ID, META_ID, META_SIZE};
pub use image::{ImageMetadata, ImageStore};
pub use layer::{LayerStore, RoLayer};
