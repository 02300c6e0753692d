// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator trait definitions.
//
// Each method receives one page's bytes and returns the replacement bytes.
// Implementations report `TransientWorker` for outages worth retrying and
// `PermanentOperation` for input they can never process.

use async_trait::async_trait;
use pagewerk_core::error::Result;
use pagewerk_core::{ExternalKind, Rotation};
use serde_json::Value;

/// All collaborators a worker can delegate to.
pub trait CollaboratorBridge:
    OcrService + FormatConverter + SecurityService + PageCompositor + Send + Sync
{
    /// Human-readable name for logs (e.g. "stub", "http").
    fn name(&self) -> &str;
}

/// Adds a recognised text layer to a page.
#[async_trait]
pub trait OcrService: Send + Sync {
    async fn recognize(&self, page: &[u8], parameters: &Value) -> Result<Vec<u8>>;
}

/// Converts a page to another representation (e.g. office format to PDF).
#[async_trait]
pub trait FormatConverter: Send + Sync {
    async fn convert(&self, page: &[u8], parameters: &Value) -> Result<Vec<u8>>;
}

/// Watermarking, encryption, permissions, sanitising and redaction.
#[async_trait]
pub trait SecurityService: Send + Sync {
    /// Apply a security action. `action` is never `Ocr` or `Convert`.
    async fn secure(&self, action: ExternalKind, page: &[u8], parameters: &Value) -> Result<Vec<u8>>;
}

/// Composes an overlay onto a page.
#[async_trait]
pub trait PageCompositor: Send + Sync {
    /// `rotation` is the page's display rotation, so the overlay can be
    /// placed upright.
    async fn compose(&self, page: &[u8], overlay: &[u8], rotation: Rotation) -> Result<Vec<u8>>;
}
