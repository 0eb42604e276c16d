//! Canonical tar encoding of directories.
//!
//! Layer ids and COPY cache ids are digests of this encoding. Entries are
//! walked in file-name order with paths relative to the root, headers use
//! `HeaderMode::Deterministic` (mtime, uid and gid normalised, only the exec
//! bit of the mode kept) and symlinks are stored as links.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use stratum_core::error::{Result, StratumError};
use stratum_core::Digest;
use walkdir::WalkDir;

/// Writer that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Digest and byte count of everything written.
    pub fn finish(self) -> (Digest, u64) {
        (Digest::from_sha256(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that hashes everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    /// Read the remainder of the stream, then return its digest and length.
    pub fn drain(mut self) -> io::Result<(Digest, u64)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok((Digest::from_sha256(self.hasher), self.read))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

/// Write the canonical tar of `dir` into `out`.
///
/// Returns the number of entries archived.
pub fn write_canonical_tar<W: Write>(dir: &Path, out: W) -> Result<usize> {
    let mut builder = canonical_builder(out);
    let count = append_tree(&mut builder, dir, Path::new(""))?;
    finish(builder)?;
    Ok(count)
}

fn canonical_builder<W: Write>(out: W) -> tar::Builder<W> {
    let mut builder = tar::Builder::new(out);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    builder
}

fn finish<W: Write>(builder: tar::Builder<W>) -> Result<()> {
    builder
        .into_inner()
        .and_then(|mut w| w.flush())
        .map_err(|e| StratumError::Registration(format!("Failed to finalize archive: {}", e)))
}

/// Append `root` below `prefix`. With an empty prefix only the contents of
/// `root` are archived; otherwise `root` itself is stored as `prefix`.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, root: &Path, prefix: &Path) -> Result<usize> {
    let min_depth = if prefix.as_os_str().is_empty() { 1 } else { 0 };

    let mut count = 0;
    for entry in WalkDir::new(root)
        .min_depth(min_depth)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            StratumError::Registration(format!(
                "Failed to walk {}: {}",
                root.display(),
                e
            ))
        })?;
        let relative = entry.path().strip_prefix(root).map_err(|e| {
            StratumError::Registration(format!(
                "Failed to compute relative path for {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        let name = if relative.as_os_str().is_empty() {
            prefix.to_path_buf()
        } else {
            prefix.join(relative)
        };

        let appended = if entry.file_type().is_dir() {
            builder.append_dir(&name, entry.path())
        } else {
            builder.append_path_with_name(entry.path(), &name)
        };
        appended.map_err(|e| {
            StratumError::Registration(format!(
                "Failed to archive {}: {}",
                name.display(),
                e
            ))
        })?;
        count += 1;
    }

    Ok(count)
}

/// Digest of a set of paths archived under their base names, in order.
///
/// `None` when nothing was archived.
pub fn sources_digest(paths: &[PathBuf]) -> Result<Option<Digest>> {
    let mut writer = HashingWriter::new(io::sink());
    let mut builder = canonical_builder(&mut writer);

    let mut count = 0;
    for path in paths {
        let base = path.file_name().map(PathBuf::from).ok_or_else(|| {
            StratumError::Registration(format!("{} has no file name", path.display()))
        })?;
        count += append_tree(&mut builder, path, &base)?;
    }
    finish(builder)?;

    if count == 0 {
        return Ok(None);
    }
    Ok(Some(writer.finish().0))
}

/// Digest and size of the canonical tar of `dir`.
///
/// `None` when the directory has no entries.
pub fn canonical_digest(dir: &Path) -> Result<Option<(Digest, u64)>> {
    let mut writer = HashingWriter::new(io::sink());
    let count = write_canonical_tar(dir, &mut writer)?;
    if count == 0 {
        return Ok(None);
    }
    Ok(Some(writer.finish()))
}

/// Canonical tar of `dir` as bytes.
#[cfg(test)]
pub(crate) fn canonical_tar_bytes(dir: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_canonical_tar(dir, &mut buf)?;
    Ok(buf)
}

/// Unpack a tar stream into `dest`, returning the digest of the raw stream.
pub fn unpack_hashed<R: Read>(reader: R, dest: &Path) -> Result<(Digest, u64)> {
    std::fs::create_dir_all(dest).map_err(|e| {
        StratumError::Registration(format!(
            "Failed to create {}: {}",
            dest.display(),
            e
        ))
    })?;

    let mut archive = tar::Archive::new(HashingReader::new(reader));
    archive.set_preserve_permissions(true);
    archive.unpack(dest).map_err(|e| {
        StratumError::Registration(format!(
            "Failed to unpack layer into {}: {}",
            dest.display(),
            e
        ))
    })?;

    archive
        .into_inner()
        .drain()
        .map_err(|e| StratumError::Registration(format!("Failed to read layer stream: {}", e)))
}
