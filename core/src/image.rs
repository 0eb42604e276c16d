//! Image and layer model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::digest::Digest;
use crate::error::Result;

/// Base reference meaning "start from an empty filesystem".
pub const SCRATCH: &str = "scratch";

/// Maximum number of layers an image may carry.
pub const MAX_LAYER_DEPTH: usize = 128;

/// Value of the synthetic trailing layer produced by the final diff pass.
pub const ROOTFS_CACHE_VALUE: &str = "rootfs cache";

/// Instruction kind of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayerKind {
    From,
    Copy,
    Run,
    Cmd,
    /// Trailing rootfs layer; never produced by the decoder.
    Base,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::From => "FROM",
            Self::Copy => "COPY",
            Self::Run => "RUN",
            Self::Cmd => "CMD",
            Self::Base => "BASE",
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an image's layer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "type")]
    pub kind: LayerKind,

    pub value: String,

    /// Content layer id; empty for FROM/CMD and no-op instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Digest>,
}

impl Layer {
    pub fn new(kind: LayerKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            id: None,
        }
    }

    pub fn from_base(reference: impl Into<String>) -> Self {
        Self::new(LayerKind::From, reference)
    }

    pub fn rootfs(id: Digest) -> Self {
        Self {
            kind: LayerKind::Base,
            value: ROOTFS_CACHE_VALUE.to_string(),
            id: Some(id),
        }
    }

    pub fn with_id(mut self, id: Option<Digest>) -> Self {
        self.id = id;
        self
    }

    /// Whether this layer carries a filesystem delta.
    pub fn is_content(&self) -> bool {
        self.id.is_some()
    }
}

/// A persisted, layered image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Digest of the record serialized without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Digest>,

    pub name: String,

    pub layers: Vec<Layer>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Image {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            id: None,
            name: name.into(),
            layers,
            annotations: BTreeMap::new(),
        }
    }

    /// Base reference from the leading FROM layer, if any.
    pub fn base(&self) -> Option<&str> {
        self.layers
            .first()
            .filter(|l| l.kind == LayerKind::From)
            .map(|l| l.value.trim())
    }

    /// Layers that carry filesystem content, in stack order.
    pub fn content_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(|l| l.is_content())
    }

    /// Content layer ids, bottom first.
    pub fn layer_ids(&self) -> Vec<Digest> {
        self.content_layers().filter_map(|l| l.id.clone()).collect()
    }

    /// Canonical bytes of the record without its id.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut record = self.clone();
        record.id = None;
        Ok(serde_json::to_vec(&record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Image {
        let id = Digest::from_bytes(b"layer");
        Image::new(
            "app:v1",
            vec![
                Layer::from_base(SCRATCH),
                Layer::new(LayerKind::Copy, "app.bin /bin/app").with_id(Some(id.clone())),
                Layer::new(LayerKind::Cmd, "/bin/app"),
                Layer::rootfs(id),
            ],
        )
    }

    #[test]
    fn test_layer_serializes_type_upper_case() {
        let layer = Layer::new(LayerKind::Run, "make");
        let json = serde_json::to_string(&layer).unwrap();
        assert_eq!(json, r#"{"type":"RUN","value":"make"}"#);
    }

    #[test]
    fn test_image_base_and_content_layers() {
        let image = sample();
        assert_eq!(image.base(), Some(SCRATCH));
        assert_eq!(image.content_layers().count(), 2);
        assert_eq!(image.layer_ids().len(), 2);
    }

    #[test]
    fn test_canonical_bytes_ignore_existing_id() {
        let mut image = sample();
        let first = image.canonical_bytes().unwrap();
        image.id = Some(Digest::from_bytes(&first));
        assert_eq!(image.canonical_bytes().unwrap(), first);
    }

    #[test]
    fn test_canonical_bytes_change_with_layers() {
        let a = sample();
        let mut b = sample();
        b.layers.push(Layer::new(LayerKind::Run, "true"));
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_rootfs_layer() {
        let layer = Layer::rootfs(Digest::from_bytes(b"x"));
        assert_eq!(layer.kind, LayerKind::Base);
        assert_eq!(layer.value, ROOTFS_CACHE_VALUE);
        assert!(layer.is_content());
    }
}
