//! Build cache: chain identities, the chain index and the per-build cursor.

pub mod chain;

use std::path::{Path, PathBuf};

use stratum_core::error::{Result, StratumError};
use stratum_core::Digest;

use crate::archive;

pub use chain::{fold_chain, CacheLayer, ChainEntry, ChainId, ChainIndex, Probe};

/// Where a build stands in the chain, and whether it may still hit.
///
/// Once a step misses, every later step must run: the cursor stays disabled
/// for the rest of the build but keeps folding chain ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCursor {
    pub parent: Option<ChainId>,
    pub enabled: bool,
}

impl CacheCursor {
    pub fn new(enabled: bool) -> Self {
        Self {
            parent: None,
            enabled,
        }
    }

    /// Cursor positioned after `layers`.
    pub fn starting_at<'a, I>(layers: I, enabled: bool) -> Result<Self>
    where
        I: IntoIterator<Item = &'a CacheLayer>,
    {
        Ok(Self {
            parent: fold_chain(layers)?,
            enabled,
        })
    }

    /// Move past a step that hit or missed.
    pub fn advance(&self, chain_id: ChainId, hit: bool) -> Self {
        Self {
            parent: Some(chain_id),
            enabled: self.enabled && hit,
        }
    }

    /// Move past a step that was not probed, keeping the enabled state.
    pub fn fold(&self, layer: &CacheLayer) -> Result<Self> {
        Ok(Self {
            parent: Some(layer.chain_id(self.parent.as_ref())?),
            enabled: self.enabled,
        })
    }

    /// Cursor for a step whose cache lookup is no longer possible.
    pub fn disabled(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            enabled: false,
        }
    }
}

/// Resolve a COPY source (glob patterns allowed) inside the build context.
///
/// Matches are sorted; `..` components are rejected.
pub fn resolve_sources(context: &Path, src: &str) -> Result<Vec<PathBuf>> {
    let relative = src.trim_start_matches("./").trim_start_matches('/');
    if Path::new(relative)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(StratumError::Config(format!(
            "copy source '{}' escapes the build context",
            src
        )));
    }
    let pattern = context.join(relative);
    let pattern_str = pattern.to_string_lossy();

    let mut matches = Vec::new();
    let entries = glob::glob(&pattern_str)
        .map_err(|e| StratumError::Config(format!("invalid copy source '{}': {}", src, e)))?;
    for entry in entries {
        let path = entry.map_err(|e| {
            StratumError::Config(format!("Failed to read copy source '{}': {}", src, e))
        })?;
        matches.push(path);
    }

    if matches.is_empty() {
        return Err(StratumError::NotFound(format!(
            "copy source '{}' in {}",
            src,
            context.display()
        )));
    }
    matches.sort();
    Ok(matches)
}

/// Digest identifying the content a COPY would bring in.
///
/// `None` (with a warning) when the sources cannot be hashed; the step then
/// carries no cache id and cannot hit.
pub fn source_digest(context: &Path, src: &str) -> Option<Digest> {
    let digest = resolve_sources(context, src).and_then(|paths| archive::sources_digest(&paths));
    match digest {
        Ok(Some(digest)) => Some(digest),
        Ok(None) => {
            tracing::warn!(src, "Copy source is empty, discarding cache");
            None
        }
        Err(e) => {
            tracing::warn!(src, error = %e, "Failed to digest copy source, discarding cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use stratum_core::{Layer, LayerKind, SCRATCH};
    use tempfile::TempDir;

    // --- cursor ---

    #[test]
    fn test_cursor_disables_after_miss() {
        let layer = CacheLayer::new(&Layer::new(LayerKind::Run, "x"), None);
        let id = layer.chain_id(None).unwrap();

        let cursor = CacheCursor::new(true);
        let hit = cursor.advance(id.clone(), true);
        assert!(hit.enabled);
        let missed = hit.advance(id.clone(), false);
        assert!(!missed.enabled);
        // A later "hit" cannot re-enable it.
        assert!(!missed.advance(id, true).enabled);
    }

    #[test]
    fn test_cursor_fold_matches_fold_chain() {
        let from = CacheLayer::new(&Layer::from_base(SCRATCH), None);
        let cmd = CacheLayer::new(&Layer::new(LayerKind::Cmd, "run"), None);
        let cursor = CacheCursor::starting_at([&from], true).unwrap().fold(&cmd).unwrap();
        assert_eq!(cursor.parent, fold_chain([&from, &cmd]).unwrap());
        assert!(cursor.enabled);
        assert!(!cursor.disabled().enabled);
    }

    // --- sources ---

    #[test]
    fn test_resolve_sources_glob() {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("b.yaml"), "b").unwrap();
        fs::write(ctx.path().join("a.yaml"), "a").unwrap();
        fs::write(ctx.path().join("c.txt"), "c").unwrap();

        let found = resolve_sources(ctx.path(), "*.yaml").unwrap();
        assert_eq!(found, vec![ctx.path().join("a.yaml"), ctx.path().join("b.yaml")]);

        let found = resolve_sources(ctx.path(), "./c.txt").unwrap();
        assert_eq!(found, vec![ctx.path().join("c.txt")]);
    }

    #[test]
    fn test_resolve_sources_missing() {
        let ctx = TempDir::new().unwrap();
        let err = resolve_sources(ctx.path(), "nope").unwrap_err();
        assert!(matches!(err, StratumError::NotFound(_)));
        assert!(matches!(
            resolve_sources(ctx.path(), "../etc/passwd"),
            Err(StratumError::Config(_))
        ));
    }

    #[test]
    fn test_source_digest_tracks_content() {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("app.bin"), "v1").unwrap();
        let v1 = source_digest(ctx.path(), "app.bin").unwrap();
        assert_eq!(source_digest(ctx.path(), "app.bin"), Some(v1.clone()));

        fs::write(ctx.path().join("app.bin"), "v2").unwrap();
        assert_ne!(source_digest(ctx.path(), "app.bin"), Some(v1));
    }

    #[test]
    fn test_source_digest_missing_is_none() {
        let ctx = TempDir::new().unwrap();
        assert!(source_digest(ctx.path(), "absent").is_none());
    }
}
