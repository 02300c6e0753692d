// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Content-level executors. These read page bytes, hand them to an external
// collaborator and store the returned bytes as new blobs. The page model
// change is always "replace these pages' blobs", recorded as artifacts so the
// orchestrator can reapply it without calling the collaborator again.

use std::sync::Arc;

use async_trait::async_trait;
use pagewerk_blob::BlobResolver;
use pagewerk_bridge::CollaboratorBridge;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{ExternalKind, Operation, OperationKind, PageArtifact, PageRef, StepOutput};
use pagewerk_model::mutation;
use tracing::{debug, instrument};

use crate::executor::{ExecutionInput, OperationExecutor};

fn wrong_kind(expected: OperationKind, op: &Operation) -> PagewerkError {
    PagewerkError::PermanentOperation(format!("{expected} executor cannot run {}", op.kind()))
}

/// Pages named by the operation, in document order. An empty selection on an
/// external operation means every page.
fn selected<'a>(pages: &'a [PageRef], ids: &[pagewerk_core::PageId]) -> Vec<&'a PageRef> {
    if ids.is_empty() {
        return pages.iter().collect();
    }
    pages.iter().filter(|p| ids.contains(&p.id)).collect()
}

fn finish(pages: &[PageRef], artifacts: Vec<PageArtifact>) -> Result<StepOutput> {
    Ok(StepOutput {
        new_page_sequence: mutation::replace_blobs(pages, &artifacts)?,
        derived_documents: Vec::new(),
        artifacts,
    })
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// Composes an overlay blob onto the selected pages via the page compositor.
pub struct OverlayExecutor {
    bridge: Arc<dyn CollaboratorBridge>,
}

impl OverlayExecutor {
    pub fn new(bridge: Arc<dyn CollaboratorBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl OperationExecutor for OverlayExecutor {
    fn kind(&self) -> OperationKind {
        OperationKind::Overlay
    }

    fn validate(&self, op: &Operation, pages: &[PageRef]) -> Result<()> {
        if !matches!(op, Operation::Overlay { .. }) {
            return Err(wrong_kind(OperationKind::Overlay, op));
        }
        mutation::validate(op, pages)
    }

    #[instrument(skip_all, fields(step = %input.step))]
    async fn apply(
        &self,
        op: &Operation,
        input: &ExecutionInput<'_>,
        blobs: &BlobResolver,
    ) -> Result<StepOutput> {
        let Operation::Overlay { pages: ids, overlay } = op else {
            return Err(wrong_kind(OperationKind::Overlay, op));
        };
        self.validate(op, &input.document.pages)?;
        let overlay_bytes = blobs.read_all(overlay)?;

        let mut artifacts = Vec::new();
        for page in selected(&input.document.pages, ids) {
            let content = blobs.read_all(&page.blob)?;
            let composed = self
                .bridge
                .compose(&content, &overlay_bytes, page.rotation)
                .await?;
            artifacts.push(PageArtifact {
                page_id: page.id,
                blob: blobs.store_bytes(&composed)?,
            });
        }
        debug!(pages = artifacts.len(), "overlay composed");
        finish(&input.document.pages, artifacts)
    }
}

// ---------------------------------------------------------------------------
// Delegate to external collaborator
// ---------------------------------------------------------------------------

/// Runs OCR, conversion and security actions through the collaborator bridge.
pub struct ExternalExecutor {
    bridge: Arc<dyn CollaboratorBridge>,
}

impl ExternalExecutor {
    pub fn new(bridge: Arc<dyn CollaboratorBridge>) -> Self {
        Self { bridge }
    }

    async fn process(&self, kind: ExternalKind, page: &[u8], parameters: &serde_json::Value) -> Result<Vec<u8>> {
        match kind {
            ExternalKind::Ocr => self.bridge.recognize(page, parameters).await,
            ExternalKind::Convert => self.bridge.convert(page, parameters).await,
            action => self.bridge.secure(action, page, parameters).await,
        }
    }
}

#[async_trait]
impl OperationExecutor for ExternalExecutor {
    fn kind(&self) -> OperationKind {
        OperationKind::External
    }

    fn validate(&self, op: &Operation, pages: &[PageRef]) -> Result<()> {
        if !matches!(op, Operation::External { .. }) {
            return Err(wrong_kind(OperationKind::External, op));
        }
        mutation::validate(op, pages)
    }

    #[instrument(skip_all, fields(step = %input.step, collaborator = self.bridge.name()))]
    async fn apply(
        &self,
        op: &Operation,
        input: &ExecutionInput<'_>,
        blobs: &BlobResolver,
    ) -> Result<StepOutput> {
        let Operation::External {
            kind,
            pages: ids,
            parameters,
        } = op
        else {
            return Err(wrong_kind(OperationKind::External, op));
        };
        self.validate(op, &input.document.pages)?;

        let mut artifacts = Vec::new();
        for page in selected(&input.document.pages, ids) {
            let content = blobs.read_all(&page.blob)?;
            let output = self.process(*kind, &content, parameters).await?;
            if output.is_empty() {
                return Err(PagewerkError::PermanentOperation(format!(
                    "{} returned no content for page {}",
                    kind.as_str(),
                    page.id
                )));
            }
            artifacts.push(PageArtifact {
                page_id: page.id,
                blob: blobs.store_bytes(&output)?,
            });
        }
        debug!(kind = kind.as_str(), pages = artifacts.len(), "external operation applied");
        finish(&input.document.pages, artifacts)
    }
}
