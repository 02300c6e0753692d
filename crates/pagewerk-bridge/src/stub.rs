// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stub bridge for deployments without external collaborators.
//
// Every call fails with `CollaboratorUnavailable`, which fails the step
// permanently rather than retrying work that can never succeed.

use async_trait::async_trait;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{ExternalKind, Rotation};
use serde_json::Value;

use crate::traits::*;

/// Bridge with nothing behind it.
pub struct StubBridge;

impl CollaboratorBridge for StubBridge {
    fn name(&self) -> &str {
        "stub"
    }
}

#[async_trait]
impl OcrService for StubBridge {
    async fn recognize(&self, _page: &[u8], _parameters: &Value) -> Result<Vec<u8>> {
        tracing::warn!("OcrService::recognize called on stub bridge");
        Err(PagewerkError::CollaboratorUnavailable("ocr".into()))
    }
}

#[async_trait]
impl FormatConverter for StubBridge {
    async fn convert(&self, _page: &[u8], _parameters: &Value) -> Result<Vec<u8>> {
        tracing::warn!("FormatConverter::convert called on stub bridge");
        Err(PagewerkError::CollaboratorUnavailable("convert".into()))
    }
}

#[async_trait]
impl SecurityService for StubBridge {
    async fn secure(&self, action: ExternalKind, _page: &[u8], _parameters: &Value) -> Result<Vec<u8>> {
        tracing::warn!(action = action.as_str(), "SecurityService::secure called on stub bridge");
        Err(PagewerkError::CollaboratorUnavailable(action.as_str().into()))
    }
}

#[async_trait]
impl PageCompositor for StubBridge {
    async fn compose(&self, _page: &[u8], _overlay: &[u8], _rotation: Rotation) -> Result<Vec<u8>> {
        tracing::warn!("PageCompositor::compose called on stub bridge");
        Err(PagewerkError::CollaboratorUnavailable("compositor".into()))
    }
}
