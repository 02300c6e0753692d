// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! pagewerk-bridge: contracts for the out-of-process collaborators that do
//! content-level work (OCR, office conversion, PDF security, page
//! composition).
//!
//! The engine never interprets page bytes itself. Executors hand page content
//! to a [`traits::CollaboratorBridge`] and store whatever bytes come back as a
//! new blob.

use std::sync::Arc;

pub mod stub;
pub mod traits;

pub use traits::{CollaboratorBridge, FormatConverter, OcrService, PageCompositor, SecurityService};

/// The collaborator bridge used when no external services are configured.
pub fn default_bridge() -> Arc<dyn CollaboratorBridge> {
    Arc::new(stub::StubBridge)
}
