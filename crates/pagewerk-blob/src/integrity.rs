// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Content hashing: SHA-256 identities for blobs, plus streaming readers that
// hash while copying and verify while resolving.

use std::io::{self, Read};

use pagewerk_core::BlobRef;
use pagewerk_core::error::{PagewerkError, Result};
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of `data` and return it as a lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that `data` matches the expected SHA-256 hex digest.
pub fn verify_hash(data: &[u8], expected_hex: &str) -> Result<()> {
    let actual = hash_bytes(data);
    if actual == expected_hex {
        Ok(())
    } else {
        Err(PagewerkError::IntegrityMismatch {
            expected: expected_hex.to_owned(),
            actual,
        })
    }
}

/// Whether `hash` has the shape of a SHA-256 hex digest.
///
/// Store keys are turned into file paths, so anything else is rejected.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub(crate) fn check_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(PagewerkError::Validation(format!("malformed blob hash {hash:?}")))
    }
}

// ---------------------------------------------------------------------------
// Streaming readers
// ---------------------------------------------------------------------------

/// Reader adaptor that hashes and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Consume the reader and return the blob reference of what was read.
    pub fn finish(self) -> BlobRef {
        BlobRef {
            hash: hex::encode(self.hasher.finalize()),
            size: self.bytes,
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Reader adaptor that checks content against a [`BlobRef`] at end of stream.
///
/// A mismatch surfaces as an `InvalidData` I/O error wrapping
/// [`PagewerkError::IntegrityMismatch`]; use [`into_blob_error`] to recover it.
pub struct VerifyingReader<R> {
    inner: R,
    expected: BlobRef,
    hasher: Sha256,
    bytes: u64,
    verified: bool,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected: BlobRef) -> Self {
        Self {
            inner,
            expected,
            hasher: Sha256::new(),
            bytes: 0,
            verified: false,
        }
    }

    pub fn blob(&self) -> &BlobRef {
        &self.expected
    }

    fn verify(&mut self) -> io::Result<()> {
        let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
        self.verified = true;
        if actual != self.expected.hash || self.bytes != self.expected.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                PagewerkError::IntegrityMismatch {
                    expected: self.expected.hash.clone(),
                    actual,
                },
            ));
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !self.verified && !buf.is_empty() {
                self.verify()?;
            }
            return Ok(0);
        }
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        if self.bytes > self.expected.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                PagewerkError::IntegrityMismatch {
                    expected: self.expected.hash.clone(),
                    actual: format!("<more than {} bytes>", self.expected.size),
                },
            ));
        }
        Ok(n)
    }
}

/// Turn an I/O error from a blob stream back into the engine error it carries.
pub fn into_blob_error(err: io::Error) -> PagewerkError {
    if !err
        .get_ref()
        .is_some_and(|inner| inner.is::<PagewerkError>())
    {
        return PagewerkError::Io(err);
    }
    match err.into_inner().map(|inner| inner.downcast::<PagewerkError>()) {
        Some(Ok(inner)) => *inner,
        _ => PagewerkError::Io(io::Error::other("blob stream failed")),
    }
}
