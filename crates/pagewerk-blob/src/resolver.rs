// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Blob reference resolver: maps page identities to their immutable content.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{BlobRef, Document, PageRef};
use tracing::{debug, instrument, warn};

use crate::integrity::{VerifyingReader, into_blob_error};
use crate::store::{BlobStore, FsBlobStore, MemoryBlobStore};

/// A lazily opened blob stream, verified against its hash at end of stream.
pub type BlobReader = VerifyingReader<Box<dyn Read + Send>>;

/// Resolves [`PageRef`]s to byte streams and stores new content.
///
/// Cheap to clone; every clone shares the same backing store.
#[derive(Clone)]
pub struct BlobResolver {
    store: Arc<dyn BlobStore>,
    max_blob_bytes: u64,
}

impl BlobResolver {
    pub fn new(store: Arc<dyn BlobStore>, max_blob_bytes: u64) -> Self {
        Self {
            store,
            max_blob_bytes,
        }
    }

    /// Resolver over a filesystem store rooted at `root`.
    pub fn filesystem(root: impl AsRef<Path>, max_blob_bytes: u64) -> Result<Self> {
        Ok(Self::new(Arc::new(FsBlobStore::open(root)?), max_blob_bytes))
    }

    pub fn in_memory(max_blob_bytes: u64) -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()), max_blob_bytes)
    }

    pub fn max_blob_bytes(&self) -> u64 {
        self.max_blob_bytes
    }

    /// Open the content of a page.
    ///
    /// Nothing is read until the returned stream is consumed. A missing blob
    /// is [`PagewerkError::BlobNotFound`], which callers treat as permanent.
    pub fn resolve(&self, page: &PageRef) -> Result<BlobReader> {
        self.resolve_blob(&page.blob).inspect_err(|e| {
            if matches!(e, PagewerkError::BlobNotFound(_)) {
                warn!(page_id = %page.id, blob = %page.blob, "page content missing");
            }
        })
    }

    pub fn resolve_blob(&self, blob: &BlobRef) -> Result<BlobReader> {
        let raw = self.store.open(&blob.hash)?;
        Ok(VerifyingReader::new(raw, blob.clone()))
    }

    /// Read and verify a whole blob into memory.
    pub fn read_all(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let mut reader = self.resolve_blob(blob)?;
        let mut data = Vec::with_capacity(blob.size.min(self.max_blob_bytes) as usize);
        reader.read_to_end(&mut data).map_err(into_blob_error)?;
        Ok(data)
    }

    /// Lazily resolve every page of a document, in page order.
    ///
    /// Each stream is opened only when the iterator reaches it.
    pub fn resolve_document<'a>(
        &'a self,
        document: &'a Document,
    ) -> impl Iterator<Item = Result<BlobReader>> + 'a {
        document.pages.iter().map(move |page| self.resolve(page))
    }

    /// Store a byte stream; identical content yields an identical reference.
    #[instrument(skip_all)]
    pub fn store(&self, reader: &mut dyn Read) -> Result<BlobRef> {
        let blob = self.store.put(reader, self.max_blob_bytes)?;
        debug!(hash = %blob.hash, size = blob.size, "content stored");
        Ok(blob)
    }

    pub fn store_bytes(&self, data: &[u8]) -> Result<BlobRef> {
        self.store(&mut &data[..])
    }

    pub fn exists(&self, blob: &BlobRef) -> Result<bool> {
        self.store.contains(&blob.hash)
    }

    /// Evict a blob from the backing store.
    pub fn evict(&self, blob: &BlobRef) -> Result<bool> {
        self.store.remove(&blob.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewerk_core::{DocumentId, PageId, Provenance, Rotation};

    fn page_for(blob: BlobRef) -> PageRef {
        PageRef {
            id: PageId::new(),
            blob,
            rotation: Rotation::Deg0,
            provenance: Provenance {
                document_id: DocumentId::new(),
                page_index: 0,
            },
        }
    }

    #[test]
    fn identical_bytes_share_one_reference() {
        let resolver = BlobResolver::in_memory(1024);
        let a = resolver.store_bytes(b"scan").unwrap();
        let b = resolver.store_bytes(b"scan").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, resolver.store_bytes(b"scan2").unwrap());
    }

    #[test]
    fn resolve_streams_page_content() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = BlobResolver::filesystem(dir.path(), 1024).unwrap();
        let page = page_for(resolver.store_bytes(b"page body").unwrap());

        let mut out = Vec::new();
        resolver.resolve(&page).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"page body");
    }

    #[test]
    fn evicted_blob_is_not_found() {
        let resolver = BlobResolver::in_memory(1024);
        let page = page_for(resolver.store_bytes(b"gone soon").unwrap());
        assert!(resolver.evict(&page.blob).unwrap());

        let err = resolver.resolve(&page).err().unwrap();
        assert!(matches!(err, PagewerkError::BlobNotFound(_)));
        assert_eq!(err.kind(), pagewerk_core::ErrorKind::BlobNotFound);
    }

    #[test]
    fn size_mismatch_fails_verification() {
        let resolver = BlobResolver::in_memory(1024);
        let mut blob = resolver.store_bytes(b"four").unwrap();
        blob.size = 3;
        assert!(matches!(
            resolver.read_all(&blob),
            Err(PagewerkError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn document_pages_resolve_lazily_in_order() {
        let resolver = BlobResolver::in_memory(1024);
        let first = page_for(resolver.store_bytes(b"1").unwrap());
        let missing = page_for(BlobRef {
            hash: "0".repeat(64),
            size: 1,
        });
        let doc = Document {
            id: DocumentId::new(),
            version: 1,
            pages: vec![first, missing],
        };

        let mut pages = resolver.resolve_document(&doc);
        let mut out = Vec::new();
        pages.next().unwrap().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"1");
        assert!(matches!(
            pages.next().unwrap(),
            Err(PagewerkError::BlobNotFound(_))
        ));
    }
}
