// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The job orchestrator.
//
//   Pending --lease--> Running --last step committed--> Succeeded
//                         |  \--permanent / exhausted / lease lost--> Failed
//                         \--cancel honoured at a step boundary--> Cancelled
//
// Exactly-once effect comes from three things working together: executors
// are deterministic, every commit carries the durable (jobId, stepIndex)
// marker, and a result is only considered while the job's cursor still
// points at its step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagewerk_blob::{BlobReader, BlobResolver};
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::{
    BlobRef, Document, DocumentId, EngineConfig, ErrorKind, INITIAL_VERSION, Job, JobError, JobId, JobOutcome,
    JobRequest, JobState, JobStatus, JobTarget, Operation, PageId, PageRef, Provenance, Rotation, Step,
    StepKey, StepOutcome, StepOutput, StepResult, StepStatus, Version, WorkItem,
};
use pagewerk_dispatch::{Dispatcher, QueueDepth, ResultHandler, RetryDecision, RetryPolicy, Shutdown, should_retry};
use pagewerk_model::mutation::{self, Mutation, MutationContext};
use pagewerk_model::{CommitOutcome, PageModelStore};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::admission;
use crate::job_store::{AttemptOutcome, AttemptRecord, JobStore};
use crate::lease::LeaseStore;

/// Compare-and-set rounds on a job row before giving up.
const CAS_ATTEMPTS: usize = 3;

/// Engine-wide snapshot for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// Job counts keyed by state name.
    pub jobs: BTreeMap<String, u64>,
    pub work_queue: QueueDepth,
    pub result_queue: QueueDepth,
    pub dead_letters: u64,
}

/// What one housekeeping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timed_out: usize,
    pub leases_lost: usize,
    pub started: usize,
}

pub struct Orchestrator {
    config: EngineConfig,
    retry: RetryPolicy,
    jobs: Arc<JobStore>,
    leases: Arc<LeaseStore>,
    pages: Arc<dyn PageModelStore>,
    blobs: BlobResolver,
    dispatcher: Dispatcher,
    /// Steps this replica has committed and advanced past. A fast path in
    /// front of the durable committed-step markers.
    committed: Mutex<HashSet<StepKey>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        jobs: Arc<JobStore>,
        leases: Arc<LeaseStore>,
        pages: Arc<dyn PageModelStore>,
        blobs: BlobResolver,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            retry: RetryPolicy::from(&config),
            config,
            jobs,
            leases,
            pages,
            blobs,
            dispatcher,
            committed: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pages(&self) -> &Arc<dyn PageModelStore> {
        &self.pages
    }

    pub fn blobs(&self) -> &BlobResolver {
        &self.blobs
    }

    // -----------------------------------------------------------------------
    // Client surface
    // -----------------------------------------------------------------------

    /// Admit a job. The returned status is always `Pending`; the job starts
    /// as soon as its document's lease is free.
    #[instrument(skip_all, fields(steps = request.operations.len()))]
    pub async fn submit(&self, request: JobRequest) -> Result<JobStatus> {
        let (target, pages, version) = match request.target {
            JobTarget::Existing(id) => {
                let document = self.pages.read(&id).map_err(|e| match e {
                    PagewerkError::DocumentNotFound(_) => {
                        PagewerkError::Validation(format!("target document {id} does not exist"))
                    }
                    other => other,
                })?;
                (id, document.pages, document.version)
            }
            JobTarget::New => (DocumentId::new(), Vec::new(), INITIAL_VERSION),
        };

        let job = Job::new(target, request.operations, version);
        admission::admit(&job.id, target, &pages, &job.operations, self.pages.as_ref(), &self.blobs)?;
        if request.target == JobTarget::New {
            self.pages.create(target, Vec::new())?;
        }
        self.jobs.insert(&job)?;
        info!(job_id = %job.id, document_id = %target, "job accepted");

        let status = job.status();
        if let Err(e) = self.try_start(job, Utc::now()).await {
            // Still pending; the next tick retries.
            warn!(job_id = %status.job_id, "job not started yet: {e}");
        }
        Ok(status)
    }

    pub fn status(&self, id: &JobId) -> Result<JobStatus> {
        Ok(self.jobs.get(id)?.status())
    }

    /// Attempt history of a job.
    pub fn attempts(&self, id: &JobId) -> Result<Vec<AttemptRecord>> {
        self.jobs.get(id)?;
        self.jobs.attempts(id)
    }

    /// Cancel a job. Pending jobs stop immediately; running jobs stop at the
    /// next step boundary.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn cancel(&self, id: &JobId) -> Result<JobStatus> {
        for _ in 0..CAS_ATTEMPTS {
            let mut job = self.jobs.get(id)?;
            let state = job.state;
            match state {
                JobState::Pending => job.state = JobState::Cancelled,
                JobState::Running if job.cancel_requested => return Ok(job.status()),
                JobState::Running => job.cancel_requested = true,
                terminal => {
                    return Err(PagewerkError::InvalidTransition(format!(
                        "job {id} is already {terminal}"
                    )));
                }
            }
            job.updated_at = Utc::now();
            if self.jobs.update_if(&mut job, state)? {
                info!(state = %job.state, "cancellation recorded");
                return Ok(job.status());
            }
        }
        Err(PagewerkError::Database(format!(
            "job {id} kept changing, cancellation not recorded"
        )))
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, id: &JobId, poll: Duration) -> Result<JobStatus> {
        loop {
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Create a document from page byte streams, in order.
    #[instrument(skip_all)]
    pub fn ingest<R: Read>(&self, pages: impl IntoIterator<Item = R>) -> Result<Document> {
        let id = DocumentId::new();
        let mut refs = Vec::new();
        for (index, page) in pages.into_iter().enumerate() {
            let page_index = u32::try_from(index)
                .map_err(|_| PagewerkError::Validation(format!("too many pages: {index}")))?;
            let mut page = BufReader::new(page);
            if page.fill_buf()?.is_empty() {
                return Err(PagewerkError::Validation(format!("page {index} is empty")));
            }
            let blob = self.blobs.store(&mut page)?;
            refs.push(PageRef {
                id: PageId::new(),
                blob,
                rotation: Rotation::Deg0,
                provenance: Provenance {
                    document_id: id,
                    page_index,
                },
            });
        }
        if refs.is_empty() {
            return Err(PagewerkError::Validation("document has no pages".into()));
        }
        let document = self.pages.create(id, refs)?;
        info!(document_id = %id, pages = document.page_count(), "document ingested");
        Ok(document)
    }

    /// The committed pages of a document, each as a verifying byte stream.
    pub fn export(&self, id: &DocumentId) -> Result<Vec<(PageRef, BlobReader)>> {
        let document = self.pages.read(id)?;
        document
            .pages
            .into_iter()
            .map(|page| {
                let reader = self.blobs.resolve(&page)?;
                Ok((page, reader))
            })
            .collect()
    }

    pub async fn health(&self) -> Result<EngineHealth> {
        let jobs = self
            .jobs
            .count_by_state()?
            .into_iter()
            .map(|(state, n)| (state.as_str().to_string(), n))
            .collect();
        let work_queue = self.dispatcher.work_depth().await?;
        let result_queue = self.dispatcher.result_depth().await?;
        Ok(EngineHealth {
            jobs,
            dead_letters: work_queue.dead + result_queue.dead,
            work_queue,
            result_queue,
        })
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Housekeeping pass: expire overdue steps, heartbeat leases of running
    /// jobs and start pending jobs whose document is free.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let ttl = self.config.lease_ttl();

        for step in self.jobs.expired_steps(now)? {
            let job = self.jobs.get(&step.key.job_id)?;
            if job.state != JobState::Running || job.cursor != step.key.step_index {
                let committed = self.pages.committed_version(&step.key)?;
                let status = if committed.is_some() {
                    StepStatus::Committed
                } else {
                    StepStatus::Failed
                };
                self.jobs.set_step_status(&step.key, status, committed)?;
                continue;
            }
            warn!(step = %step.key, attempt = step.attempt, "step deadline elapsed");
            report.timed_out += 1;
            let attempt = step.attempt;
            let failure = "deadline elapsed without a result".to_string();
            if let Err(e) = self
                .on_failure(job, step, attempt, ErrorKind::TransientWorker, failure, AttemptOutcome::TimedOut)
                .await
            {
                error!("timeout handling failed: {e}");
            }
        }

        for job in self.jobs.jobs_in_state(JobState::Running)? {
            if !self.leases.renew(&job.target, &job.id, now, ttl)? {
                report.leases_lost += 1;
                let index = job.cursor;
                self.fail(job, Some(index), ErrorKind::LeaseLost, "lease expired and was taken over".into())?;
                continue;
            }
            // Crashed between marking the job running and dispatching.
            if self.jobs.step(&job.current_step_key())?.is_none()
                && let Err(e) = self.dispatch(&job, 1, Duration::ZERO).await
            {
                error!(job_id = %job.id, "dispatch failed: {e}");
            }
        }

        for job in self.jobs.jobs_in_state(JobState::Pending)? {
            let id = job.id;
            match self.try_start(job, now).await {
                Ok(true) => report.started += 1,
                Ok(false) => {}
                Err(e) => error!(job_id = %id, "start failed: {e}"),
            }
        }
        if report != TickReport::default() {
            debug!(?report, "tick");
        }
        Ok(report)
    }

    /// Resume running jobs after a restart.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let now = Utc::now();
        let mut resumed = 0;
        for job in self.jobs.jobs_in_state(JobState::Running)? {
            let key = job.current_step_key();
            if let Some(version) = self.pages.committed_version(&key)? {
                info!(step = %key, version, "step committed before restart, advancing");
                self.jobs.set_step_status(&key, StepStatus::Committed, Some(version))?;
                self.advance(job, version).await?;
            } else if !self.leases.acquire(&job.target, &job.id, now, self.config.lease_ttl())? {
                let index = job.cursor;
                self.fail(
                    job,
                    Some(index),
                    ErrorKind::LeaseLost,
                    "lease taken over while the orchestrator was down".into(),
                )?;
            } else {
                let attempt = self.jobs.step(&key)?.map_or(1, |s| s.attempt + 1);
                self.dispatch(&job, attempt, Duration::ZERO).await?;
            }
            resumed += 1;
        }
        info!(resumed, "recovery complete");
        Ok(resumed)
    }

    /// Spawn the result pump and the housekeeping loop.
    pub fn start(self: &Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let pump = self.dispatcher.on_result(self.clone(), shutdown.clone());

        let this = self.clone();
        let stop = shutdown.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = tokio::time::sleep(this.config.poll_interval()) => {}
                }
                if let Err(e) = this.tick(Utc::now()).await {
                    error!("tick failed: {e}");
                }
            }
            debug!("housekeeping stopped");
        });
        vec![pump, ticker]
    }

    // -----------------------------------------------------------------------
    // Result handling
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(step = %result.idempotency_key, attempt = result.attempt))]
    async fn apply_result(&self, result: StepResult) -> Result<()> {
        let key = result.step_key();
        if self.already_committed(&key) {
            debug!("duplicate result discarded");
            return Ok(());
        }
        let job = match self.jobs.get(&key.job_id) {
            Ok(job) => job,
            Err(PagewerkError::JobNotFound(_)) => {
                warn!("result for unknown job discarded");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if job.state != JobState::Running || job.cursor != key.step_index {
            debug!(state = %job.state, cursor = job.cursor, "late result discarded");
            return Ok(());
        }
        let Some(step) = self.jobs.step(&key)? else {
            warn!("result for a step that was never dispatched");
            return Ok(());
        };

        match result.outcome {
            StepOutcome::Success(output) => self.on_success(job, step, result.attempt, output).await,
            StepOutcome::Failure(failure) => {
                self.on_failure(job, step, result.attempt, failure.kind, failure.message, AttemptOutcome::Failed)
                    .await
            }
        }
    }

    async fn on_success(&self, job: Job, step: Step, attempt: u32, output: StepOutput) -> Result<()> {
        let key = step.key;
        if !self.leases.renew(&job.target, &job.id, Utc::now(), self.config.lease_ttl())? {
            let message = format!("lease on document {} lost", job.target);
            self.jobs
                .record_attempt(&key, attempt, AttemptOutcome::Failed, Some((ErrorKind::LeaseLost, message.as_str())))?;
            return self.fail(job, Some(key.step_index), ErrorKind::LeaseLost, message);
        }

        let version = match self.commit_step(&job, &step, &output) {
            Ok(outcome) => {
                if let CommitOutcome::AlreadyCommitted(v) = outcome {
                    debug!(version = v, "step was already committed");
                }
                outcome.version()
            }
            Err(e) if e.kind().is_transient() => return Err(e),
            Err(e) => {
                let message = e.to_string();
                self.jobs
                    .record_attempt(&key, attempt, AttemptOutcome::Failed, Some((e.kind(), message.as_str())))?;
                return self.fail(job, Some(key.step_index), e.kind(), message);
            }
        };
        self.jobs.set_step_status(&key, StepStatus::Committed, Some(version))?;
        self.jobs.record_attempt(&key, attempt, AttemptOutcome::Succeeded, None)?;
        self.advance(job, version).await
    }

    /// Commit a step's output; on a version conflict, reapply the operation
    /// to the fresh page sequence, up to the configured ceiling.
    fn commit_step(&self, job: &Job, step: &Step, output: &StepOutput) -> Result<CommitOutcome> {
        let key = step.key;
        let as_executed = |_: &[PageRef]| -> Result<Mutation> {
            Ok(Mutation {
                pages: output.new_page_sequence.clone(),
                derived: output.derived_documents.clone(),
            })
        };
        let mut result = self
            .pages
            .commit(&job.target, step.input_version, Some(&key), &as_executed);

        let mut reapplied = 0;
        loop {
            match result {
                Err(PagewerkError::Conflict { expected, actual })
                    if reapplied < self.config.conflict_retry_limit =>
                {
                    reapplied += 1;
                    warn!(step = %key, expected, actual, reapplied, "version conflict, reapplying");
                    let sources = self.load_sources(&step.operation, job.target)?;
                    let ctx = MutationContext {
                        step: key,
                        target: job.target,
                        sources: &sources,
                        artifacts: &output.artifacts,
                    };
                    let reapply = |pages: &[PageRef]| mutation::apply(&step.operation, pages, &ctx);
                    result = self.pages.commit(&job.target, actual, Some(&key), &reapply);
                }
                other => return other,
            }
        }
    }

    async fn on_failure(
        &self,
        job: Job,
        step: Step,
        attempt: u32,
        kind: ErrorKind,
        message: String,
        outcome: AttemptOutcome,
    ) -> Result<()> {
        let key = step.key;
        if attempt < step.attempt || step.status != StepStatus::Dispatched {
            debug!(current = step.attempt, "stale failure ignored");
            return Ok(());
        }
        if let Some(version) = self.pages.committed_version(&key)? {
            // Committed by an earlier result but the job never advanced.
            debug!(version, "failure for a committed step, advancing instead");
            return self.advance(job, version).await;
        }
        self.jobs.record_attempt(&key, attempt, outcome, Some((kind, message.as_str())))?;

        if job.cancel_requested && kind.is_transient() {
            return self.stop_cancelled(job, key);
        }
        match should_retry(kind, step.attempt, &self.retry) {
            RetryDecision::RetryAfter(delay) => {
                info!(step = %key, next = step.attempt + 1, delay_ms = delay.as_millis() as u64, "retrying step");
                self.dispatch(&job, step.attempt + 1, delay).await
            }
            RetryDecision::GiveUp(kind) => self.fail(job, Some(key.step_index), kind, message),
            RetryDecision::Exhausted => self.fail(
                job,
                Some(key.step_index),
                kind,
                format!("gave up after {} attempts: {message}", step.attempt),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn try_start(&self, mut job: Job, now: DateTime<Utc>) -> Result<bool> {
        if !self.leases.acquire(&job.target, &job.id, now, self.config.lease_ttl())? {
            debug!(job_id = %job.id, document_id = %job.target, "document busy, job stays pending");
            return Ok(false);
        }
        let document = self.pages.read(&job.target)?;
        job.document_version = document.version;
        job.state = JobState::Running;
        job.updated_at = Utc::now();
        if !self.jobs.update_if(&mut job, JobState::Pending)? {
            if self.jobs.get(&job.id)?.state.is_terminal() {
                self.leases.release(&job.target, &job.id)?;
            }
            return Ok(false);
        }
        info!(job_id = %job.id, version = document.version, "job started");
        self.dispatch(&job, 1, Duration::ZERO).await?;
        Ok(true)
    }

    /// Record and publish the job's current step.
    async fn dispatch(&self, job: &Job, attempt: u32, delay: Duration) -> Result<()> {
        let operation = job.current_operation().cloned().ok_or_else(|| {
            PagewerkError::InvalidTransition(format!("job {} has no step {}", job.id, job.cursor))
        })?;
        let budget = chrono::Duration::from_std(delay + self.config.step_timeout())
            .map_err(|e| PagewerkError::Config(format!("step timeout out of range: {e}")))?;
        let step = Step {
            key: job.current_step_key(),
            operation,
            input_document: job.target,
            input_version: job.document_version,
            attempt,
            deadline: Utc::now() + budget,
            status: StepStatus::Dispatched,
            committed_version: None,
        };
        let blobs = self.required_blobs(&step)?;

        // The step record goes first so a crash before publish is recovered.
        self.jobs.put_step(&step)?;
        self.jobs.record_attempt(&step.key, attempt, AttemptOutcome::Dispatched, None)?;
        self.dispatcher.publish(&WorkItem::for_step(&step, blobs)?, delay).await?;
        debug!(step = %step.key, attempt, version = step.input_version, "step dispatched");
        Ok(())
    }

    async fn advance(&self, job: Job, version: Version) -> Result<()> {
        let key = job.current_step_key();
        let advanced = self.transition(job, |job| {
            if let Some(op) = job.current_operation() {
                let derived = mutation::derived_ids(op, &key);
                job.derived_documents.extend(derived);
            }
            job.document_version = version;
            job.cursor += 1;
            if job.cursor >= job.total_steps() {
                job.state = JobState::Succeeded;
                job.outcome = Some(JobOutcome {
                    document_id: job.target,
                    version,
                    derived_documents: job.derived_documents.clone(),
                });
            } else if job.cancel_requested {
                job.state = JobState::Cancelled;
            }
        })?;
        self.remember(key);
        let Some(job) = advanced else {
            debug!(step = %key, "job already moved past this step");
            return Ok(());
        };

        if job.state.is_terminal() {
            info!(job_id = %job.id, state = %job.state, version, "job finished");
            return self.finish(&job);
        }
        debug!(job_id = %job.id, cursor = job.cursor, version, "advancing");
        self.dispatch(&job, 1, Duration::ZERO).await
    }

    fn stop_cancelled(&self, job: Job, key: StepKey) -> Result<()> {
        let Some(job) = self.transition(job, |job| job.state = JobState::Cancelled)? else {
            return Ok(());
        };
        self.jobs.set_step_status(&key, StepStatus::Failed, None)?;
        info!(job_id = %job.id, step = %key, "job cancelled instead of retrying");
        self.finish(&job)
    }

    fn fail(&self, job: Job, step_index: Option<u32>, kind: ErrorKind, message: String) -> Result<()> {
        let failed = self.transition(job, |job| {
            job.state = JobState::Failed;
            job.error = Some(JobError {
                step_index,
                kind,
                message: message.clone(),
            });
        })?;
        let Some(job) = failed else {
            debug!("job moved on before it could be failed");
            return Ok(());
        };
        if let Some(index) = step_index {
            self.jobs
                .set_step_status(&StepKey::new(job.id, index), StepStatus::Failed, None)?;
        }
        error!(job_id = %job.id, step = ?step_index, %kind, "job failed: {message}");
        self.finish(&job)
    }

    /// Apply `change` to a running job at its current step and store it.
    ///
    /// A lost compare-and-set re-reads the row and applies `change` again to
    /// the fresh copy, so concurrent writes such as a cancellation request
    /// are never overwritten. Returns `None` once the job has finished or
    /// moved to another step.
    fn transition(&self, mut job: Job, change: impl Fn(&mut Job)) -> Result<Option<Job>> {
        let cursor = job.cursor;
        for _ in 0..CAS_ATTEMPTS {
            if job.state != JobState::Running || job.cursor != cursor {
                return Ok(None);
            }
            change(&mut job);
            job.updated_at = Utc::now();
            if self.jobs.update_if(&mut job, JobState::Running)? {
                return Ok(Some(job));
            }
            job = self.jobs.get(&job.id)?;
        }
        Err(PagewerkError::Database(format!(
            "job {} kept changing, transition not recorded",
            job.id
        )))
    }

    fn finish(&self, job: &Job) -> Result<()> {
        self.leases.release(&job.target, &job.id)?;
        if let Ok(mut committed) = self.committed.lock() {
            committed.retain(|k| k.job_id != job.id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn already_committed(&self, key: &StepKey) -> bool {
        self.committed
            .lock()
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    fn remember(&self, key: StepKey) {
        if let Ok(mut committed) = self.committed.lock() {
            committed.insert(key);
        }
    }

    fn load_sources(&self, op: &Operation, target: DocumentId) -> Result<HashMap<DocumentId, Vec<PageRef>>> {
        let mut sources = HashMap::new();
        for id in op.referenced_documents() {
            if *id != target && !sources.contains_key(id) {
                sources.insert(*id, self.pages.read(id)?.pages);
            }
        }
        Ok(sources)
    }

    /// Blobs a content-level step will read.
    fn required_blobs(&self, step: &Step) -> Result<Vec<BlobRef>> {
        let (ids, extra) = match &step.operation {
            Operation::Overlay { pages, overlay } => (pages.as_slice(), Some(overlay.clone())),
            Operation::External { pages, .. } => (pages.as_slice(), None),
            _ => return Ok(Vec::new()),
        };
        let document = self.pages.read(&step.input_document)?;
        let mut blobs: Vec<BlobRef> = document
            .pages
            .iter()
            .filter(|p| ids.is_empty() || ids.contains(&p.id))
            .map(|p| p.blob.clone())
            .chain(extra)
            .collect();
        let mut seen = HashSet::new();
        blobs.retain(|b| seen.insert(b.hash.clone()));
        Ok(blobs)
    }
}

#[async_trait]
impl ResultHandler for Orchestrator {
    async fn handle_result(&self, result: StepResult) -> Result<()> {
        self.apply_result(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewerk_dispatch::SqliteQueue;
    use pagewerk_executor::builtin::BuiltinExecutor;
    use pagewerk_executor::{ExecutionInput, ExecutorRegistry, OperationExecutor, Worker};
    use pagewerk_model::SqlitePageStore;
    use pagewerk_core::OperationKind;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        orch: Arc<Orchestrator>,
        worker: Worker,
        dispatcher: Dispatcher,
        pages: Arc<SqlitePageStore>,
        jobs: Arc<JobStore>,
        leases: Arc<LeaseStore>,
        blobs: BlobResolver,
        config: EngineConfig,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::with_builtins(pagewerk_bridge::default_bridge())
    }

    impl Harness {
        fn new() -> Self {
            Self::build(config(), registry(), Duration::from_secs(30))
        }

        fn build(config: EngineConfig, registry: ExecutorRegistry, visibility: Duration) -> Self {
            let queue = SqliteQueue::open_in_memory(config.max_deliveries).expect("queue");
            let dispatcher = Dispatcher::new(Arc::new(queue), visibility, Duration::from_millis(1));
            let pages = Arc::new(SqlitePageStore::open_in_memory().expect("pages"));
            let jobs = Arc::new(JobStore::open_in_memory().expect("jobs"));
            let leases = Arc::new(LeaseStore::open_in_memory().expect("leases"));
            let blobs = BlobResolver::in_memory(1 << 20);
            let orch = Arc::new(Orchestrator::new(
                config.clone(),
                jobs.clone(),
                leases.clone(),
                pages.clone(),
                blobs.clone(),
                dispatcher.clone(),
            ));
            let worker = Worker::new(0, dispatcher.clone(), Arc::new(registry), pages.clone(), blobs.clone());
            Self {
                orch,
                worker,
                dispatcher,
                pages,
                jobs,
                leases,
                blobs,
                config,
            }
        }

        /// Run worker and result pump until both are idle.
        async fn drive(&self) {
            for _ in 0..200 {
                let worked = self.worker.run_once().await.expect("worker");
                let handled = self.dispatcher.pump_once(self.orch.as_ref()).await.expect("pump");
                if !worked && !handled {
                    return;
                }
            }
            panic!("engine did not go idle");
        }

        fn document(&self, n: u32) -> Document {
            self.orch
                .ingest((0..n).map(|i| Cursor::new(format!("page {i}").into_bytes())))
                .expect("ingest")
        }

        async fn submit(&self, target: DocumentId, operations: Vec<Operation>) -> JobId {
            self.orch
                .submit(JobRequest {
                    target: JobTarget::Existing(target),
                    operations,
                })
                .await
                .expect("submit")
                .job_id
        }

        fn status(&self, id: &JobId) -> JobStatus {
            self.orch.status(id).expect("status")
        }

        fn read(&self, id: &DocumentId) -> Document {
            self.pages.read(id).expect("read")
        }
    }

    fn ids(pages: &[PageRef]) -> Vec<PageId> {
        pages.iter().map(|p| p.id).collect()
    }

    fn rotate(pages: Vec<PageId>) -> Operation {
        Operation::Rotate {
            pages,
            angle: Rotation::Deg90,
        }
    }

    // -- Scenarios -------------------------------------------------------------

    #[tokio::test]
    async fn rotate_then_delete() {
        let h = Harness::new();
        let doc = h.document(5);
        let p = &doc.pages;
        let job = h
            .submit(
                doc.id,
                vec![
                    rotate(vec![p[1].id, p[3].id]),
                    Operation::Delete { pages: vec![p[2].id] },
                ],
            )
            .await;
        h.drive().await;

        let status = h.status(&job);
        assert_eq!(status.state, JobState::Succeeded);
        let result = h.read(&doc.id);
        assert_eq!(result.version, 3);
        assert_eq!(ids(&result.pages), vec![p[0].id, p[1].id, p[3].id, p[4].id]);
        let rotations: Vec<i32> = result.pages.iter().map(|p| p.rotation.degrees()).collect();
        assert_eq!(rotations, vec![0, 90, 90, 0]);
        assert_eq!(status.outcome.expect("outcome").version, 3);
    }

    #[tokio::test]
    async fn split_produces_documents_with_provenance() {
        let h = Harness::new();
        let doc = h.document(5);
        let job = h.submit(doc.id, vec![Operation::Split { boundaries: vec![2] }]).await;
        h.drive().await;

        let outcome = h.status(&job).outcome.expect("outcome");
        assert_eq!(outcome.derived_documents.len(), 2);
        let first = h.read(&outcome.derived_documents[0]);
        let second = h.read(&outcome.derived_documents[1]);
        assert_eq!(first.page_count(), 2);
        assert_eq!(second.page_count(), 3);
        let origins: Vec<(DocumentId, u32)> = first
            .pages
            .iter()
            .chain(&second.pages)
            .map(|p| (p.provenance.document_id, p.provenance.page_index))
            .collect();
        assert_eq!(origins, (0..5).map(|i| (doc.id, i)).collect::<Vec<_>>());
        // The source keeps its pages; the split still commits one version.
        assert_eq!(h.read(&doc.id).version, 2);
        assert_eq!(ids(&h.read(&doc.id).pages), ids(&doc.pages));
    }

    #[tokio::test]
    async fn duplicate_delivery_commits_once() {
        let h = Harness::new();
        let doc = h.document(3);
        let job = h
            .submit(
                doc.id,
                vec![
                    rotate(vec![doc.pages[0].id]),
                    Operation::Delete {
                        pages: vec![doc.pages[1].id],
                    },
                ],
            )
            .await;

        let delivery = h.dispatcher.next_work().await.expect("receive").expect("work");
        let first = h.worker.execute(&delivery.item).await;
        let second = h.worker.execute(&delivery.item).await;
        assert_eq!(first, second);

        h.orch.handle_result(first).await.expect("first");
        h.orch.handle_result(second.clone()).await.expect("second");
        h.dispatcher.ack(&delivery.token).await.expect("ack");
        assert_eq!(h.read(&doc.id).version, 2);

        // A replica without in-memory state relies on the durable records.
        let replica = Orchestrator::new(
            h.config.clone(),
            h.jobs.clone(),
            h.leases.clone(),
            h.pages.clone(),
            h.blobs.clone(),
            h.dispatcher.clone(),
        );
        replica.handle_result(second).await.expect("replica");
        assert_eq!(h.read(&doc.id).version, 2);

        h.drive().await;
        assert_eq!(h.status(&job).state, JobState::Succeeded);
        assert_eq!(h.read(&doc.id).version, 3);
    }

    #[tokio::test]
    async fn unknown_page_is_rejected_at_admission() {
        let h = Harness::new();
        let doc = h.document(2);
        let err = h
            .orch
            .submit(JobRequest {
                target: JobTarget::Existing(doc.id),
                operations: vec![rotate(vec![PageId::new()])],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.jobs.count_by_state().expect("count").is_empty());
        assert_eq!(h.dispatcher.work_depth().await.expect("depth").ready, 0);

        let missing = h
            .orch
            .submit(JobRequest {
                target: JobTarget::Existing(DocumentId::new()),
                operations: vec![rotate(vec![PageId::new()])],
            })
            .await
            .unwrap_err();
        assert!(matches!(missing, PagewerkError::Validation(_)));
    }

    // -- Properties ------------------------------------------------------------

    #[tokio::test]
    async fn each_step_starts_from_the_previous_commit() {
        let h = Harness::new();
        let doc = h.document(4);
        let p = &doc.pages;
        let job = h
            .submit(
                doc.id,
                vec![
                    rotate(vec![p[0].id]),
                    Operation::Reorder {
                        order: vec![p[3].id, p[2].id, p[1].id, p[0].id],
                    },
                    Operation::Delete { pages: vec![p[3].id] },
                ],
            )
            .await;
        h.drive().await;
        assert_eq!(h.status(&job).state, JobState::Succeeded);

        for index in 0..3u32 {
            let step = h
                .jobs
                .step(&StepKey::new(job, index))
                .expect("step")
                .expect("recorded");
            assert_eq!(step.input_version, 1 + u64::from(index));
            assert_eq!(step.committed_version, Some(2 + u64::from(index)));
            assert_eq!(step.status, StepStatus::Committed);
        }
        assert_eq!(ids(&h.read(&doc.id).pages), vec![p[2].id, p[1].id, p[0].id]);
    }

    #[tokio::test]
    async fn jobs_on_one_document_run_one_after_another() {
        let h = Harness::new();
        let doc = h.document(5);
        let p = &doc.pages;
        let first = h.submit(doc.id, vec![Operation::Delete { pages: vec![p[4].id] }]).await;
        let second = h.submit(doc.id, vec![rotate(vec![p[0].id])]).await;
        assert_eq!(h.status(&second).state, JobState::Pending);

        h.drive().await;
        assert_eq!(h.status(&first).state, JobState::Succeeded);
        assert_eq!(h.status(&second).state, JobState::Pending);

        let report = h.orch.tick(Utc::now()).await.expect("tick");
        assert_eq!(report.started, 1);
        h.drive().await;

        assert_eq!(h.status(&second).state, JobState::Succeeded);
        let step = h
            .jobs
            .step(&StepKey::new(second, 0))
            .expect("step")
            .expect("recorded");
        assert_eq!(step.input_version, h.status(&first).outcome.expect("outcome").version);

        let result = h.read(&doc.id);
        assert_eq!(result.version, 3);
        assert_eq!(result.page_count(), 4);
        assert_eq!(result.pages[0].rotation, Rotation::Deg90);
    }

    #[tokio::test]
    async fn conflicting_commit_is_reapplied_to_the_fresh_sequence() {
        let h = Harness::new();
        let doc = h.document(3);
        let p = &doc.pages;
        let job = h.submit(doc.id, vec![rotate(vec![p[0].id])]).await;
        assert!(h.worker.run_once().await.expect("worker"));

        // Someone else reverses the document while the result is in flight.
        h.pages
            .commit(&doc.id, 1, None, &|pages: &[PageRef]| -> Result<Mutation> {
                Ok(Mutation::pages(pages.iter().rev().cloned().collect()))
            })
            .expect("external commit");

        h.drive().await;
        let status = h.status(&job);
        assert_eq!(status.state, JobState::Succeeded);
        let result = h.read(&doc.id);
        assert_eq!(result.version, 3);
        assert_eq!(ids(&result.pages), vec![p[2].id, p[1].id, p[0].id]);
        assert_eq!(result.pages[2].rotation, Rotation::Deg90);
    }

    #[tokio::test]
    async fn conflicts_past_the_ceiling_fail_the_job() {
        let h = Harness::build(
            EngineConfig {
                conflict_retry_limit: 0,
                ..config()
            },
            registry(),
            Duration::from_secs(30),
        );
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;
        assert!(h.worker.run_once().await.expect("worker"));
        h.pages
            .commit(&doc.id, 1, None, &|pages: &[PageRef]| -> Result<Mutation> {
                Ok(Mutation::pages(pages.to_vec()))
            })
            .expect("external commit");

        h.drive().await;
        let status = h.status(&job);
        assert_eq!(status.state, JobState::Failed);
        let error = status.error.expect("error");
        assert_eq!(error.kind, ErrorKind::Conflict);
        assert_eq!(error.step_index, Some(0));
        assert_eq!(h.read(&doc.id).version, 2);
        assert!(h.leases.get(&doc.id).expect("lease").is_none());
    }

    #[tokio::test]
    async fn merge_of_split_parts_reconstructs_the_document() {
        let h = Harness::new();
        let doc = h.document(5);
        let split = h.submit(doc.id, vec![Operation::Split { boundaries: vec![2] }]).await;
        h.drive().await;
        let parts = h.status(&split).outcome.expect("outcome").derived_documents;

        let merge = h
            .orch
            .submit(JobRequest {
                target: JobTarget::New,
                operations: vec![Operation::Merge { documents: parts }],
            })
            .await
            .expect("submit")
            .job_id;
        h.drive().await;

        let outcome = h.status(&merge).outcome.expect("outcome");
        let merged = h.read(&outcome.document_id);
        let content = |pages: &[PageRef]| -> Vec<(String, Rotation)> {
            pages.iter().map(|p| (p.blob.hash.clone(), p.rotation)).collect()
        };
        assert_eq!(content(&merged.pages), content(&doc.pages));
    }

    // -- Failure paths -----------------------------------------------------------

    #[tokio::test]
    async fn lost_lease_fails_without_committing() {
        let h = Harness::new();
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;

        let later = Utc::now() + chrono::Duration::seconds(h.config.lease_ttl_secs as i64 * 2);
        assert!(
            h.leases
                .acquire(&doc.id, &JobId::new(), later, h.config.lease_ttl())
                .expect("steal")
        );

        h.drive().await;
        let status = h.status(&job);
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.expect("error").kind, ErrorKind::LeaseLost);
        assert_eq!(h.read(&doc.id).version, 1);
    }

    struct Flaky {
        remaining: AtomicU32,
        inner: BuiltinExecutor,
    }

    impl Flaky {
        fn failing(times: u32) -> Self {
            Self {
                remaining: AtomicU32::new(times),
                inner: BuiltinExecutor::new(OperationKind::Rotate).expect("builtin"),
            }
        }
    }

    #[async_trait]
    impl OperationExecutor for Flaky {
        fn kind(&self) -> OperationKind {
            OperationKind::Rotate
        }

        fn validate(&self, op: &Operation, pages: &[PageRef]) -> Result<()> {
            self.inner.validate(op, pages)
        }

        async fn apply(&self, op: &Operation, input: &ExecutionInput<'_>, blobs: &BlobResolver) -> Result<StepOutput> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PagewerkError::TransientWorker("worker crashed".into()));
            }
            self.inner.apply(op, input, blobs).await
        }
    }

    fn flaky_registry(times: u32) -> ExecutorRegistry {
        let mut registry = registry();
        registry.register(Arc::new(Flaky::failing(times)));
        registry
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let h = Harness::build(config(), flaky_registry(1), Duration::from_secs(30));
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;
        h.drive().await;

        assert_eq!(h.status(&job).state, JobState::Succeeded);
        assert_eq!(h.read(&doc.id).version, 2);
        let history: Vec<(u32, AttemptOutcome)> = h
            .orch
            .attempts(&job)
            .expect("attempts")
            .into_iter()
            .map(|r| (r.attempt, r.outcome))
            .collect();
        assert_eq!(
            history,
            vec![
                (1, AttemptOutcome::Dispatched),
                (1, AttemptOutcome::Failed),
                (2, AttemptOutcome::Dispatched),
                (2, AttemptOutcome::Succeeded),
            ]
        );
    }

    #[tokio::test]
    async fn transient_failure_after_cancel_stops_the_job() {
        let h = Harness::build(config(), flaky_registry(1), Duration::from_secs(30));
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;

        assert!(h.worker.run_once().await.expect("worker"));
        h.orch.cancel(&job).expect("cancel");
        h.drive().await;

        let status = h.status(&job);
        assert_eq!(status.state, JobState::Cancelled);
        assert!(status.error.is_none());
        assert_eq!(h.read(&doc.id).version, 1);
        let step = h.jobs.step(&StepKey::new(job, 0)).expect("step").expect("recorded");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempt, 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let h = Harness::build(
            EngineConfig {
                max_step_attempts: 2,
                ..config()
            },
            flaky_registry(10),
            Duration::from_secs(30),
        );
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;
        h.drive().await;

        let status = h.status(&job);
        assert_eq!(status.state, JobState::Failed);
        let error = status.error.expect("error");
        assert_eq!(error.kind, ErrorKind::TransientWorker);
        assert_eq!(error.step_index, Some(0));
        assert_eq!(h.read(&doc.id).version, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let h = Harness::new();
        let doc = h.document(2);
        let job = h
            .submit(
                doc.id,
                vec![Operation::External {
                    kind: pagewerk_core::ExternalKind::Ocr,
                    pages: Vec::new(),
                    parameters: serde_json::Value::Null,
                }],
            )
            .await;
        h.drive().await;

        let status = h.status(&job);
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.expect("error").kind, ErrorKind::PermanentOperation);
        let dispatched = h
            .orch
            .attempts(&job)
            .expect("attempts")
            .iter()
            .filter(|r| r.outcome == AttemptOutcome::Dispatched)
            .count();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn elapsed_deadline_redispatches_without_double_commit() {
        let h = Harness::new();
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;

        let overdue = Utc::now() + chrono::Duration::seconds(h.config.step_timeout_secs as i64 + 1);
        let report = h.orch.tick(overdue).await.expect("tick");
        assert_eq!(report.timed_out, 1);
        let step = h.jobs.step(&StepKey::new(job, 0)).expect("step").expect("recorded");
        assert_eq!(step.attempt, 2);

        h.drive().await;
        assert_eq!(h.status(&job).state, JobState::Succeeded);
        assert_eq!(h.read(&doc.id).version, 2);
    }

    #[tokio::test]
    async fn dead_lettered_work_fails_the_job() {
        let h = Harness::build(
            EngineConfig {
                max_deliveries: 1,
                ..config()
            },
            registry(),
            Duration::ZERO,
        );
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;

        // Delivered once to a worker that never acknowledges it.
        assert!(h.dispatcher.next_work().await.expect("receive").is_some());
        assert!(h.dispatcher.next_work().await.expect("receive").is_none());

        h.dispatcher.pump_once(h.orch.as_ref()).await.expect("pump");
        let status = h.status(&job);
        assert_eq!(status.state, JobState::Failed);
        let error = status.error.expect("error");
        assert_eq!(error.kind, ErrorKind::PermanentOperation);
        assert!(error.message.contains("dead-lettered"));
    }

    // -- Cancellation ------------------------------------------------------------

    #[tokio::test]
    async fn running_job_stops_at_the_next_step_boundary() {
        let h = Harness::new();
        let doc = h.document(3);
        let job = h
            .submit(
                doc.id,
                vec![
                    rotate(vec![doc.pages[0].id]),
                    Operation::Delete {
                        pages: vec![doc.pages[1].id],
                    },
                ],
            )
            .await;
        let status = h.orch.cancel(&job).expect("cancel");
        assert_eq!(status.state, JobState::Running);
        assert!(status.cancel_requested);

        h.drive().await;
        let status = h.status(&job);
        assert_eq!(status.state, JobState::Cancelled);
        assert_eq!(status.step_cursor, 1);
        // The in-flight step completed; the next one never ran.
        assert_eq!(h.read(&doc.id).version, 2);
        assert_eq!(h.read(&doc.id).page_count(), 3);

        assert!(matches!(
            h.orch.cancel(&job),
            Err(PagewerkError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn cancel_during_result_handling_is_not_overwritten() {
        let h = Harness::new();
        let doc = h.document(3);
        let job = h
            .submit(
                doc.id,
                vec![
                    rotate(vec![doc.pages[0].id]),
                    Operation::Delete {
                        pages: vec![doc.pages[1].id],
                    },
                ],
            )
            .await;

        let delivery = h.dispatcher.next_work().await.expect("receive").expect("work");
        let result = h.worker.execute(&delivery.item).await;
        h.dispatcher.ack(&delivery.token).await.expect("ack");

        // The job row is read before the cancellation lands.
        let loaded = h.jobs.get(&job).expect("job");
        let step = h.jobs.step(&StepKey::new(job, 0)).expect("step").expect("recorded");
        h.orch.cancel(&job).expect("cancel");
        let StepOutcome::Success(output) = result.outcome else {
            panic!("rotation step did not succeed");
        };
        h.orch
            .on_success(loaded, step, result.attempt, output)
            .await
            .expect("success");
        h.drive().await;

        let status = h.status(&job);
        assert_eq!(status.state, JobState::Cancelled);
        assert_eq!(status.step_cursor, 1);
        assert_eq!(h.read(&doc.id).version, 2);
        assert_eq!(h.read(&doc.id).page_count(), 3);
        assert!(h.jobs.step(&StepKey::new(job, 1)).expect("step").is_none());
    }

    #[tokio::test]
    async fn pending_job_is_cancelled_immediately() {
        let h = Harness::new();
        let doc = h.document(2);
        let _running = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;
        let waiting = h.submit(doc.id, vec![rotate(vec![doc.pages[1].id])]).await;

        assert_eq!(h.orch.cancel(&waiting).expect("cancel").state, JobState::Cancelled);
        h.drive().await;
        assert_eq!(h.orch.tick(Utc::now()).await.expect("tick").started, 0);
        assert_eq!(h.status(&waiting).state, JobState::Cancelled);
        assert_eq!(h.read(&doc.id).pages[1].rotation, Rotation::Deg0);
    }

    // -- Recovery, ingest, health -------------------------------------------------

    #[tokio::test]
    async fn recovery_redispatches_lost_work() {
        let h = Harness::new();
        let doc = h.document(2);
        let job = h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;

        // The work item is lost: taken off the queue and acknowledged unexecuted.
        let delivery = h.dispatcher.next_work().await.expect("receive").expect("work");
        h.dispatcher.ack(&delivery.token).await.expect("ack");

        assert_eq!(h.orch.recover().await.expect("recover"), 1);
        h.drive().await;
        assert_eq!(h.status(&job).state, JobState::Succeeded);
        let step = h.jobs.step(&StepKey::new(job, 0)).expect("step").expect("recorded");
        assert_eq!(step.attempt, 2);
    }

    #[tokio::test]
    async fn recovery_advances_past_a_committed_step() {
        let h = Harness::new();
        let doc = h.document(3);
        let job = h
            .submit(
                doc.id,
                vec![
                    rotate(vec![doc.pages[0].id]),
                    Operation::Delete {
                        pages: vec![doc.pages[1].id],
                    },
                ],
            )
            .await;

        // Step 0 committed, then the orchestrator stopped before advancing.
        let first = StepKey::new(job, 0);
        let delivery = h.dispatcher.next_work().await.expect("receive").expect("work");
        h.dispatcher.ack(&delivery.token).await.expect("ack");
        let committed = h
            .pages
            .commit(&doc.id, INITIAL_VERSION, Some(&first), &|pages: &[PageRef]| -> Result<Mutation> {
                Ok(Mutation::pages(pages.to_vec()))
            })
            .expect("commit");
        assert_eq!(committed.version(), 2);
        assert_eq!(h.status(&job).step_cursor, 0);

        assert_eq!(h.orch.recover().await.expect("recover"), 1);
        assert_eq!(h.status(&job).step_cursor, 1);
        let step = h.jobs.step(&first).expect("step").expect("recorded");
        assert_eq!(step.status, StepStatus::Committed);
        assert_eq!(step.committed_version, Some(2));

        h.drive().await;
        assert_eq!(h.status(&job).state, JobState::Succeeded);
        let result = h.read(&doc.id);
        assert_eq!(result.version, 3);
        assert_eq!(ids(&result.pages), vec![doc.pages[0].id, doc.pages[2].id]);
        let dispatched_first = h
            .orch
            .attempts(&job)
            .expect("attempts")
            .iter()
            .filter(|r| r.step_index == 0 && r.outcome == AttemptOutcome::Dispatched)
            .count();
        assert_eq!(dispatched_first, 1);
    }

    #[tokio::test]
    async fn ingest_and_export_preserve_page_order() {
        let h = Harness::new();
        let doc = h.document(3);
        assert_eq!(doc.version, INITIAL_VERSION);

        let mut contents = Vec::new();
        for (page, mut reader) in h.orch.export(&doc.id).expect("export") {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).expect("read");
            assert_eq!(bytes.len() as u64, page.blob.size);
            contents.push(String::from_utf8(bytes).expect("utf8"));
        }
        assert_eq!(contents, vec!["page 0", "page 1", "page 2"]);

        let empty = h.orch.ingest(vec![Cursor::new(Vec::new())]).unwrap_err();
        assert!(matches!(empty, PagewerkError::Validation(_)));
        let nothing = BlobRef {
            hash: pagewerk_blob::hash_bytes(b""),
            size: 0,
        };
        assert!(!h.blobs.exists(&nothing).expect("exists"));
    }

    #[tokio::test]
    async fn health_reports_jobs_and_queues() {
        let h = Harness::new();
        let doc = h.document(1);
        h.submit(doc.id, vec![rotate(vec![doc.pages[0].id])]).await;

        let health = h.orch.health().await.expect("health");
        assert_eq!(health.jobs.get("running"), Some(&1));
        assert_eq!(health.work_queue.ready, 1);
        assert_eq!(health.dead_letters, 0);
    }
}
