// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operation executor contract.

use std::collections::HashMap;

use async_trait::async_trait;
use pagewerk_blob::BlobResolver;
use pagewerk_core::error::Result;
use pagewerk_core::{Document, DocumentId, Operation, OperationKind, PageRef, StepKey, StepOutput};

/// Everything an executor reads for one step.
pub struct ExecutionInput<'a> {
    pub step: StepKey,
    /// The target document as read by the worker.
    pub document: &'a Document,
    /// Page sequences of other documents the operation references (merge).
    pub sources: &'a HashMap<DocumentId, Vec<PageRef>>,
}

/// Implements one operation kind.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Check parameters against a page sequence without doing any work.
    fn validate(&self, op: &Operation, pages: &[PageRef]) -> Result<()>;

    /// Compute the step's output.
    ///
    /// Must be deterministic in `(op, input)` and must not write anything but
    /// new blobs.
    async fn apply(
        &self,
        op: &Operation,
        input: &ExecutionInput<'_>,
        blobs: &BlobResolver,
    ) -> Result<StepOutput>;
}
