// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Admission checks run before a job is persisted.
//
// The operation list is simulated against the target's current page
// sequence, so a step that references a page removed by an earlier step of
// the same job is rejected up front. Every rejection is a validation error.

use std::collections::HashMap;

use pagewerk_blob::BlobResolver;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{DocumentId, ErrorKind, JobId, Operation, PageRef, StepKey};
use pagewerk_model::mutation::{self, MutationContext};
use pagewerk_model::PageModelStore;
use tracing::debug;

fn rejected(step_index: usize, e: PagewerkError) -> PagewerkError {
    match e.kind() {
        ErrorKind::Validation | ErrorKind::PermanentOperation | ErrorKind::BlobNotFound => {
            PagewerkError::Validation(format!("step {step_index}: {e}"))
        }
        _ => e,
    }
}

/// Validate the operations of job `job_id` against `pages`, the target's
/// current sequence.
pub fn admit(
    job_id: &JobId,
    target: DocumentId,
    pages: &[PageRef],
    operations: &[Operation],
    store: &dyn PageModelStore,
    blobs: &BlobResolver,
) -> Result<()> {
    if operations.is_empty() {
        return Err(PagewerkError::Validation("job has no operations".into()));
    }

    let mut simulated = pages.to_vec();
    let mut sources: HashMap<DocumentId, Vec<PageRef>> = HashMap::new();
    for (i, op) in operations.iter().enumerate() {
        for document in op.referenced_documents() {
            if *document == target || sources.contains_key(document) {
                continue;
            }
            let source = store.read(document).map_err(|e| rejected(i, e))?;
            sources.insert(*document, source.pages);
        }
        if let Operation::Overlay { overlay, .. } = op
            && !blobs.exists(overlay)?
        {
            return Err(PagewerkError::Validation(format!(
                "step {i}: overlay content {overlay} not found"
            )));
        }

        mutation::validate(op, &simulated).map_err(|e| rejected(i, e))?;
        let ctx = MutationContext {
            step: StepKey::new(*job_id, i as u32),
            target,
            sources: &sources,
            artifacts: &[],
        };
        simulated = mutation::apply(op, &simulated, &ctx)
            .map_err(|e| rejected(i, e))?
            .pages;
    }
    debug!(steps = operations.len(), pages = simulated.len(), "job admitted");
    Ok(())
}
