// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! pagewerk-blob: the blob reference resolver.
//!
//! Page content lives in an immutable, content-addressed store keyed by the
//! SHA-256 of the bytes. Storing the same bytes twice yields the same
//! [`BlobRef`](pagewerk_core::BlobRef); reads are streamed lazily and
//! verified against the hash when the stream is exhausted.

pub mod integrity;
pub mod resolver;
pub mod store;

pub use integrity::{hash_bytes, verify_hash};
pub use resolver::{BlobReader, BlobResolver};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};
