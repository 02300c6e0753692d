// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Content-addressed blob stores.
//
// Blobs are immutable: a write whose hash already exists is discarded, so the
// same bytes always map to the same reference and nothing is rewritten in
// place.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use pagewerk_core::BlobRef;
use pagewerk_core::error::{PagewerkError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::integrity::{HashingReader, check_hash};

/// Backing storage for blobs, keyed by SHA-256 hex digest.
pub trait BlobStore: Send + Sync {
    fn contains(&self, hash: &str) -> Result<bool>;

    /// Open a raw (unverified) stream over a blob's bytes.
    ///
    /// Fails with [`PagewerkError::BlobNotFound`] when the blob is absent.
    fn open(&self, hash: &str) -> Result<Box<dyn Read + Send>>;

    /// Stream `reader` into the store, returning its content reference.
    ///
    /// Fails with [`PagewerkError::Validation`] when the content exceeds
    /// `max_bytes`.
    fn put(&self, reader: &mut dyn Read, max_bytes: u64) -> Result<BlobRef>;

    /// Evict a blob. Returns whether it was present.
    fn remove(&self, hash: &str) -> Result<bool>;
}

fn too_large(max_bytes: u64) -> PagewerkError {
    PagewerkError::Validation(format!("blob exceeds the {max_bytes} byte limit"))
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Blobs on local disk, sharded as `<root>/<hash[0..2]>/<hash>`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, hash: &str) -> Result<PathBuf> {
        check_hash(hash)?;
        Ok(self.root.join(&hash[..2]).join(hash))
    }
}

impl BlobStore for FsBlobStore {
    fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.path_for(hash)?.is_file())
    }

    fn open(&self, hash: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_for(hash)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PagewerkError::BlobNotFound(hash.to_owned()))
            }
            Err(e) => Err(PagewerkError::Io(e)),
        }
    }

    #[instrument(skip_all, fields(root = %self.root.display()))]
    fn put(&self, reader: &mut dyn Read, max_bytes: u64) -> Result<BlobRef> {
        // Stage next to the final location so the rename stays on one filesystem.
        let mut staged = NamedTempFile::new_in(&self.root)?;
        let mut hashing = HashingReader::new(reader.take(max_bytes.saturating_add(1)));
        io::copy(&mut hashing, staged.as_file_mut())?;
        if hashing.bytes_read() > max_bytes {
            return Err(too_large(max_bytes));
        }
        let blob = hashing.finish();

        let path = self.path_for(&blob.hash)?;
        if path.is_file() {
            debug!(hash = %blob.hash, "blob already stored");
            return Ok(blob);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        staged.as_file().sync_all()?;
        match staged.persist_noclobber(&path) {
            Ok(_) => {}
            // A concurrent writer stored identical bytes first.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(PagewerkError::Io(e.error)),
        }
        debug!(hash = %blob.hash, size = blob.size, "blob stored");
        Ok(blob)
    }

    fn remove(&self, hash: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(hash)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PagewerkError::Io(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store for tests and ephemeral engines.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| PagewerkError::Io(io::Error::other("blob map lock poisoned")))
    }

    pub fn len(&self) -> usize {
        self.blobs().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs()?.contains_key(hash))
    }

    fn open(&self, hash: &str) -> Result<Box<dyn Read + Send>> {
        let data = self
            .blobs()?
            .get(hash)
            .cloned()
            .ok_or_else(|| PagewerkError::BlobNotFound(hash.to_owned()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn put(&self, reader: &mut dyn Read, max_bytes: u64) -> Result<BlobRef> {
        let mut hashing = HashingReader::new(reader.take(max_bytes.saturating_add(1)));
        let mut data = Vec::new();
        hashing.read_to_end(&mut data)?;
        if hashing.bytes_read() > max_bytes {
            return Err(too_large(max_bytes));
        }
        let blob = hashing.finish();
        self.blobs()?.entry(blob.hash.clone()).or_insert(data);
        Ok(blob)
    }

    fn remove(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs()?.remove(hash).is_some())
    }
}
