// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Built-in executors: merge, split, rotate, reorder, delete and extract work
// directly on the page model and never touch page bytes.

use std::collections::HashSet;

use async_trait::async_trait;
use pagewerk_blob::BlobResolver;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{Operation, OperationKind, PageRef, StepOutput};
use pagewerk_model::mutation::{self, MutationContext};
use tracing::debug;

use crate::executor::{ExecutionInput, OperationExecutor};

/// Executor for one page-model-only operation kind.
pub struct BuiltinExecutor {
    kind: OperationKind,
}

impl BuiltinExecutor {
    pub const KINDS: [OperationKind; 6] = [
        OperationKind::Merge,
        OperationKind::Split,
        OperationKind::Rotate,
        OperationKind::Reorder,
        OperationKind::Delete,
        OperationKind::Extract,
    ];

    /// `None` for kinds that need content-level work.
    pub fn new(kind: OperationKind) -> Option<Self> {
        Self::KINDS.contains(&kind).then_some(Self { kind })
    }

    fn check_kind(&self, op: &Operation) -> Result<()> {
        if op.kind() != self.kind {
            return Err(PagewerkError::PermanentOperation(format!(
                "{} executor cannot run {}",
                self.kind,
                op.kind()
            )));
        }
        Ok(())
    }
}

/// Every blob referenced by `pages` must still exist.
fn require_blobs<'a>(blobs: &BlobResolver, pages: impl Iterator<Item = &'a PageRef>) -> Result<()> {
    let mut checked = HashSet::new();
    for page in pages {
        if checked.insert(&page.blob.hash) && !blobs.exists(&page.blob)? {
            return Err(PagewerkError::BlobNotFound(page.blob.hash.clone()));
        }
    }
    Ok(())
}

#[async_trait]
impl OperationExecutor for BuiltinExecutor {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &Operation, pages: &[PageRef]) -> Result<()> {
        self.check_kind(op)?;
        mutation::validate(op, pages)
    }

    async fn apply(
        &self,
        op: &Operation,
        input: &ExecutionInput<'_>,
        blobs: &BlobResolver,
    ) -> Result<StepOutput> {
        self.validate(op, &input.document.pages)?;
        let ctx = MutationContext {
            step: input.step,
            target: input.document.id,
            sources: input.sources,
            artifacts: &[],
        };
        let result = mutation::apply(op, &input.document.pages, &ctx)?;

        // Pages pulled in from other documents may point at evicted content.
        if let Operation::Merge { .. } = op {
            require_blobs(blobs, result.pages.iter())?;
        }
        debug!(
            kind = %self.kind,
            pages = result.pages.len(),
            derived = result.derived.len(),
            "built-in operation applied"
        );
        Ok(StepOutput {
            new_page_sequence: result.pages,
            derived_documents: result.derived,
            artifacts: Vec::new(),
        })
    }
}
