// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker runtime: pull a work item, execute it, report the result, ack.
//
// Workers never write the page model. Everything they produce travels back
// to the orchestrator as a StepResult, so a crashed or duplicated worker can
// at worst produce an extra result that the orchestrator discards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pagewerk_blob::BlobResolver;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{StepOutput, StepResult, WorkItem};
use pagewerk_dispatch::{Dispatcher, Shutdown};
use pagewerk_model::PageModelStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::ExecutionInput;
use crate::registry::ExecutorRegistry;

pub struct Worker {
    id: usize,
    dispatcher: Dispatcher,
    registry: Arc<ExecutorRegistry>,
    pages: Arc<dyn PageModelStore>,
    blobs: BlobResolver,
}

impl Worker {
    pub fn new(
        id: usize,
        dispatcher: Dispatcher,
        registry: Arc<ExecutorRegistry>,
        pages: Arc<dyn PageModelStore>,
        blobs: BlobResolver,
    ) -> Self {
        Self {
            id,
            dispatcher,
            registry,
            pages,
            blobs,
        }
    }

    /// Handle at most one work item. Returns whether one was received.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(delivery) = self.dispatcher.next_work().await? else {
            return Ok(false);
        };
        let item = &delivery.item;

        // The orchestrator already treats an elapsed deadline as a transient
        // failure and has scheduled the next attempt.
        if item.is_expired(Utc::now()) {
            debug!(worker = self.id, key = %item.idempotency_key, "dropping expired work item");
            self.dispatcher.ack(&delivery.token).await?;
            return Ok(true);
        }

        let result = self.execute(item).await;
        match self.dispatcher.report(&result).await {
            Ok(()) => {
                self.dispatcher.ack(&delivery.token).await?;
            }
            Err(e) => {
                // Leave the item for redelivery; re-execution is harmless.
                warn!(worker = self.id, key = %item.idempotency_key, "result not reported: {e}");
                self.dispatcher
                    .nack(&delivery.token, self.dispatcher.poll_interval())
                    .await?;
            }
        }
        Ok(true)
    }

    /// Execute a work item. Never fails: errors become failure results.
    #[instrument(skip_all, fields(worker = self.id, key = %item.idempotency_key, attempt = item.attempt))]
    pub async fn execute(&self, item: &WorkItem) -> StepResult {
        match self.try_execute(item).await {
            Ok(output) => {
                debug!(pages = output.new_page_sequence.len(), "step executed");
                StepResult::success(item, output)
            }
            Err(e) => {
                warn!(kind = %e.kind(), "step failed: {e}");
                StepResult::failure(item, e.kind(), e.to_string())
            }
        }
    }

    async fn try_execute(&self, item: &WorkItem) -> Result<StepOutput> {
        let op = item.operation()?;
        let executor = self.registry.get(op.kind())?;
        let document = self.pages.read(&item.input_document_id)?;

        let mut sources = HashMap::new();
        for id in op.referenced_documents() {
            if *id != document.id && !sources.contains_key(id) {
                sources.insert(*id, self.pages.read(id)?.pages);
            }
        }
        executor.validate(&op, &document.pages)?;

        let input = ExecutionInput {
            step: item.step_key(),
            document: &document,
            sources: &sources,
        };
        let remaining = (item.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        match tokio::time::timeout(remaining, executor.apply(&op, &input, &self.blobs)).await {
            Ok(output) => output,
            Err(_) => Err(PagewerkError::TransientWorker(format!(
                "step {} exceeded its deadline",
                item.idempotency_key
            ))),
        }
    }

    /// Process work until `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) {
        info!(worker = self.id, "worker started");
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(handled) => !handled,
                Err(e) => {
                    error!(worker = self.id, "worker error: {e}");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(self.dispatcher.poll_interval()) => {}
                }
            }
        }
        info!(worker = self.id, "worker stopped");
    }
}

/// Spawn `count` workers sharing the same collaborators.
pub fn spawn_pool(
    count: usize,
    dispatcher: &Dispatcher,
    registry: Arc<ExecutorRegistry>,
    pages: Arc<dyn PageModelStore>,
    blobs: &BlobResolver,
    shutdown: &Shutdown,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let worker = Worker::new(id, dispatcher.clone(), registry.clone(), pages.clone(), blobs.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
