//! Digest-keyed blob storage with per-layer metadata.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<hex>              blob bytes
//! layerdb/sha256/<hex>/<key>      per-layer metadata
//! ```
//!
//! Every write goes through a temp file in the destination directory and is
//! renamed into place, so readers never observe partial content.

use std::io::Write;
use std::path::{Path, PathBuf};

use stratum_core::error::{Result, StratumError};
use stratum_core::Digest;

/// Metadata key holding a layer's own id.
pub const META_ID: &str = "id";
/// Metadata key holding a layer's canonical tar size.
pub const META_SIZE: &str = "size";
/// Metadata key holding the COPY source digest a layer was built from.
pub const META_CACHE_ID: &str = "cache-id";

/// Append-only blob store plus out-of-band layer attributes.
pub trait ContentStore: Send + Sync {
    /// Store bytes, returning their digest. Existing blobs are left untouched.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Read a blob, verifying it still hashes to `digest`.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    fn contains(&self, digest: &Digest) -> bool;

    /// Every stored blob.
    fn list(&self) -> Result<Vec<(Digest, Vec<u8>)>>;

    fn delete(&self, digest: &Digest) -> Result<()>;

    fn set_metadata(&self, layer: &Digest, key: &str, data: &[u8]) -> Result<()>;

    /// `NotFound` when the key was never written.
    fn get_metadata(&self, layer: &Digest, key: &str) -> Result<Vec<u8>>;

    /// Drop all metadata of a layer.
    fn delete_metadata(&self, layer: &Digest) -> Result<()>;

    /// Layers that have a metadata directory.
    fn metadata_layers(&self) -> Result<Vec<Digest>>;
}

/// Filesystem-backed [`ContentStore`].
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [store.blob_dir(), store.layerdb_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StratumError::Store(format!(
                    "Failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn layerdb_dir(&self) -> PathBuf {
        self.root.join("layerdb").join("sha256")
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blob_dir().join(digest.hex())
    }

    fn metadata_dir(&self, layer: &Digest) -> PathBuf {
        self.layerdb_dir().join(layer.hex())
    }
}

impl ContentStore for FsContentStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        if data.is_empty() {
            return Err(StratumError::Store("refusing to store an empty blob".to_string()));
        }

        let digest = Digest::from_bytes(data);
        let path = self.blob_path(&digest);
        if path.exists() {
            return Ok(digest);
        }

        write_atomic(&path, data)?;
        tracing::debug!(digest = %digest, size = data.len(), "Stored blob");
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StratumError::NotFound(format!("blob {}", digest)));
            }
            Err(e) => {
                return Err(StratumError::Store(format!(
                    "Failed to read blob {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let actual = Digest::from_bytes(&data);
        if &actual != digest {
            return Err(StratumError::Store(format!(
                "blob {} is corrupt: content hashes to {}",
                digest, actual
            )));
        }
        Ok(data)
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    fn list(&self) -> Result<Vec<(Digest, Vec<u8>)>> {
        let mut blobs = Vec::new();
        for digest in list_hex_entries(&self.blob_dir())? {
            match self.get(&digest) {
                Ok(data) => blobs.push((digest, data)),
                Err(e) => tracing::warn!(digest = %digest, error = %e, "Skipping unreadable blob"),
            }
        }
        Ok(blobs)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StratumError::Store(format!(
                "Failed to delete blob {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn set_metadata(&self, layer: &Digest, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        write_atomic(&self.metadata_dir(layer).join(key), data)
    }

    fn get_metadata(&self, layer: &Digest, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let path = self.metadata_dir(layer).join(key);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StratumError::NotFound(format!("metadata {} of layer {}", key, layer))
            } else {
                StratumError::Store(format!(
                    "Failed to read metadata {}: {}",
                    path.display(),
                    e
                ))
            }
        })
    }

    fn delete_metadata(&self, layer: &Digest) -> Result<()> {
        let dir = self.metadata_dir(layer);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StratumError::Store(format!(
                "Failed to delete metadata {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    fn metadata_layers(&self) -> Result<Vec<Digest>> {
        list_hex_entries(&self.layerdb_dir())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.starts_with('.') {
        return Err(StratumError::Store(format!("invalid metadata key '{}'", key)));
    }
    Ok(())
}

/// Digests named by the hex entries of a directory; stray names are skipped.
fn list_hex_entries(dir: &Path) -> Result<Vec<Digest>> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| {
        StratumError::Store(format!("Failed to read {}: {}", dir.display(), e))
    })?;

    let mut digests = Vec::new();
    for entry in read_dir {
        let entry = entry
            .map_err(|e| StratumError::Store(format!("Failed to read directory entry: {}", e)))?;
        let name = entry.file_name();
        match name.to_str().map(Digest::from_hex) {
            Some(Ok(digest)) => digests.push(digest),
            _ => tracing::debug!(entry = ?name, dir = %dir.display(), "Ignoring non-digest entry"),
        }
    }
    digests.sort();
    Ok(digests)
}

/// Write `data` to `path` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StratumError::Store(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| {
        StratumError::Store(format!("Failed to create {}: {}", parent.display(), e))
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        StratumError::Store(format!(
            "Failed to create temp file in {}: {}",
            parent.display(),
            e
        ))
    })?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StratumError::Store(format!("Failed to write {}: {}", path.display(), e)))?;
    tmp.persist(path).map_err(|e| {
        StratumError::Store(format!("Failed to persist {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsContentStore) {
        let tmp = TempDir::new().unwrap();
        let store = FsContentStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    // --- blobs ---

    #[test]
    fn test_put_and_get() {
        let (_tmp, store) = store();
        let digest = store.put(b"hello").unwrap();
        assert_eq!(digest, Digest::from_bytes(b"hello"));
        assert_eq!(store.get(&digest).unwrap(), b"hello");
        assert!(store.contains(&digest));
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_tmp, store) = store();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_put_empty_rejected() {
        let (_tmp, store) = store();
        assert!(matches!(store.put(b""), Err(StratumError::Store(_))));
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_tmp, store) = store();
        let err = store.get(&Digest::from_bytes(b"nope")).unwrap_err();
        assert!(matches!(err, StratumError::NotFound(_)));
    }

    #[test]
    fn test_get_detects_corruption() {
        let (tmp, store) = store();
        let digest = store.put(b"original").unwrap();
        std::fs::write(
            tmp.path().join("blobs/sha256").join(digest.hex()),
            b"tampered",
        )
        .unwrap();
        let err = store.get(&digest).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn test_list_and_delete() {
        let (tmp, store) = store();
        let a = store.put(b"a").unwrap();
        store.put(b"b").unwrap();
        std::fs::write(tmp.path().join("blobs/sha256/stray.tmp"), b"x").unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        store.delete(&a).unwrap();
        store.delete(&a).unwrap();
        assert!(!store.contains(&a));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    // --- metadata ---

    #[test]
    fn test_metadata_roundtrip() {
        let (_tmp, store) = store();
        let layer = Digest::from_bytes(b"layer");
        store.set_metadata(&layer, META_CACHE_ID, b"sha256:abc").unwrap();
        assert_eq!(store.get_metadata(&layer, META_CACHE_ID).unwrap(), b"sha256:abc");
        assert_eq!(store.metadata_layers().unwrap(), vec![layer.clone()]);

        store.delete_metadata(&layer).unwrap();
        assert!(matches!(
            store.get_metadata(&layer, META_CACHE_ID),
            Err(StratumError::NotFound(_))
        ));
    }

    #[test]
    fn test_metadata_rejects_path_keys() {
        let (_tmp, store) = store();
        let layer = Digest::from_bytes(b"layer");
        assert!(store.set_metadata(&layer, "../escape", b"x").is_err());
        assert!(store.set_metadata(&layer, "", b"x").is_err());
    }

    #[test]
    fn test_write_atomic_replaces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
