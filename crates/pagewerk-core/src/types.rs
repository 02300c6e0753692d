// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Pagewerk job engine: identities, the page model,
// operations, jobs, steps, and the queue wire messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, PagewerkError, Result};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Deterministic identity derived from a namespace and a name.
            ///
            /// Re-running the same step derives the same ids, which keeps
            /// duplicate executions byte-for-byte identical.
            pub fn derived(namespace: &Uuid, name: &str) -> Self {
                Self(Uuid::new_v5(namespace, name.as_bytes()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = PagewerkError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| PagewerkError::Validation(format!("invalid id {s:?}: {e}")))
            }
        }
    };
}

uuid_id!(
    /// Identity of a document (a versioned ordered sequence of pages).
    DocumentId
);
uuid_id!(
    /// Stable per-page identity; survives reordering and rotation.
    PageId
);
uuid_id!(
    /// Identity of a client-submitted job.
    JobId
);

/// Page-model version. Increments by exactly one per committed mutation.
pub type Version = u64;

/// Version assigned to a freshly created document.
pub const INITIAL_VERSION: Version = 1;

// ---------------------------------------------------------------------------
// Page model
// ---------------------------------------------------------------------------

/// Reference to an immutable, content-addressed blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    /// SHA-256 of the content, lowercase hex.
    pub hash: String,
    /// Content length in bytes.
    pub size: u64,
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.hash)
    }
}

/// Page rotation, always a quarter turn multiple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Normalise any multiple of 90 (negative values included) into a rotation.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            _ => Some(Self::Deg270),
        }
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Add another rotation, modulo 360.
    pub fn add(self, other: Rotation) -> Rotation {
        // Both operands are quarter-turn multiples, so this cannot fail.
        Self::from_degrees(self.degrees() + other.degrees()).unwrap_or_default()
    }
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    fn try_from(degrees: i32) -> std::result::Result<Self, Self::Error> {
        Self::from_degrees(degrees)
            .ok_or_else(|| format!("rotation must be a multiple of 90, got {degrees}"))
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Where a page originally came from, kept across split/merge/extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: DocumentId,
    /// Zero-based index of the page in its originating document.
    pub page_index: u32,
}

/// One page of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub id: PageId,
    pub blob: BlobRef,
    #[serde(default)]
    pub rotation: Rotation,
    pub provenance: Provenance,
}

/// A committed snapshot of a document's page model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub version: Version,
    pub pages: Vec<PageRef>,
}

impl Document {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, id: &PageId) -> Option<&PageRef> {
        self.pages.iter().find(|p| p.id == *id)
    }

    pub fn contains_page(&self, id: &PageId) -> bool {
        self.page(id).is_some()
    }
}

/// A document created as a side product of a step (split parts, extracted pages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedDocument {
    pub id: DocumentId,
    pub pages: Vec<PageRef>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Content-level work delegated to an external collaborator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalKind {
    Ocr,
    Convert,
    Watermark,
    Encrypt,
    Decrypt,
    Permissions,
    Sanitize,
    Redact,
}

impl ExternalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Convert => "convert",
            Self::Watermark => "watermark",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Permissions => "permissions",
            Self::Sanitize => "sanitize",
            Self::Redact => "redact",
        }
    }
}

/// A single transformation against a document's page model.
///
/// Operations name pages by stable id rather than position so that they can
/// be reapplied against a fresher page sequence after an optimistic conflict.
/// Split is the one positional operation: its boundaries are page indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub enum Operation {
    /// Replace the target's pages with the concatenation of these documents'
    /// pages, in the given order. The target may appear in the list.
    Merge { documents: Vec<DocumentId> },
    /// Produce one new document per contiguous part; a boundary `k` starts a
    /// new part at index `k`.
    Split { boundaries: Vec<u32> },
    /// Add `angle` to each listed page's rotation.
    Rotate { pages: Vec<PageId>, angle: Rotation },
    /// Permute pages into exactly this order (a bijection over current ids).
    Reorder { order: Vec<PageId> },
    /// Remove pages, preserving the relative order of survivors.
    Delete { pages: Vec<PageId> },
    /// Produce one new single-page document per listed page.
    Extract { pages: Vec<PageId> },
    /// Compose the overlay blob onto each listed page.
    Overlay { pages: Vec<PageId>, overlay: BlobRef },
    /// Forward to an external collaborator. An empty page list means every page.
    External {
        kind: ExternalKind,
        #[serde(default)]
        pages: Vec<PageId>,
        #[serde(default)]
        parameters: serde_json::Value,
    },
}

/// Fieldless mirror of [`Operation`], used on the wire and to key executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Merge,
    Split,
    Rotate,
    Reorder,
    Delete,
    Extract,
    Overlay,
    External,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Split => "split",
            Self::Rotate => "rotate",
            Self::Reorder => "reorder",
            Self::Delete => "delete",
            Self::Extract => "extract",
            Self::Overlay => "overlay",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Merge { .. } => OperationKind::Merge,
            Self::Split { .. } => OperationKind::Split,
            Self::Rotate { .. } => OperationKind::Rotate,
            Self::Reorder { .. } => OperationKind::Reorder,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Extract { .. } => OperationKind::Extract,
            Self::Overlay { .. } => OperationKind::Overlay,
            Self::External { .. } => OperationKind::External,
        }
    }

    /// Page ids this operation names explicitly.
    pub fn referenced_pages(&self) -> &[PageId] {
        match self {
            Self::Rotate { pages, .. }
            | Self::Delete { pages }
            | Self::Extract { pages }
            | Self::Overlay { pages, .. }
            | Self::External { pages, .. } => pages,
            Self::Reorder { order } => order,
            Self::Merge { .. } | Self::Split { .. } => &[],
        }
    }

    /// Other documents this operation reads from.
    pub fn referenced_documents(&self) -> &[DocumentId] {
        match self {
            Self::Merge { documents } => documents,
            _ => &[],
        }
    }

    /// Split into the `(operationKind, operationParameters)` wire pair.
    pub fn to_parts(&self) -> Result<(OperationKind, serde_json::Value)> {
        let mut value = serde_json::to_value(self)?;
        let parameters = value
            .get_mut("parameters")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((self.kind(), parameters))
    }

    /// Rebuild an operation from its wire pair.
    pub fn from_parts(kind: OperationKind, parameters: serde_json::Value) -> Result<Self> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("kind".into(), serde_json::Value::from(kind.as_str()));
        envelope.insert("parameters".into(), parameters);
        serde_json::from_value(serde_json::Value::Object(envelope)).map_err(|e| {
            PagewerkError::Validation(format!("malformed {kind} parameters: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, waiting for the document lease.
    Pending,
    /// Steps are being dispatched in order.
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states are final; nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = PagewerkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PagewerkError::Database(format!("invalid job state: {other}"))),
        }
    }
}

/// Target of a job request: an existing document or a fresh empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobTarget {
    Existing(DocumentId),
    New,
}

impl TryFrom<String> for JobTarget {
    type Error = PagewerkError;

    fn try_from(value: String) -> Result<Self> {
        if value.eq_ignore_ascii_case("new") {
            Ok(Self::New)
        } else {
            value.parse().map(Self::Existing)
        }
    }
}

impl From<JobTarget> for String {
    fn from(target: JobTarget) -> Self {
        match target {
            JobTarget::Existing(id) => id.to_string(),
            JobTarget::New => "new".to_string(),
        }
    }
}

/// A client submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub target: JobTarget,
    pub operations: Vec<Operation>,
}

/// Where a job stopped and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Failing step, or `None` when the job failed outside any step.
    pub step_index: Option<u32>,
    pub kind: ErrorKind,
    pub message: String,
}

/// What a successful job produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub document_id: DocumentId,
    pub version: Version,
    /// Documents created by split/extract steps, in creation order.
    #[serde(default)]
    pub derived_documents: Vec<DocumentId>,
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: DocumentId,
    pub operations: Vec<Operation>,
    pub state: JobState,
    /// Index of the step currently in flight (or next to run).
    pub cursor: u32,
    /// Latest committed version of the target observed by this job.
    pub document_version: Version,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Documents derived so far by split/extract steps.
    pub derived_documents: Vec<DocumentId>,
    pub outcome: Option<JobOutcome>,
    pub error: Option<JobError>,
    /// Row revision, bumped by every stored update. Writers compare-and-set
    /// on it, so a write based on a stale read never lands.
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    pub fn new(target: DocumentId, operations: Vec<Operation>, document_version: Version) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            target,
            operations,
            state: JobState::Pending,
            cursor: 0,
            document_version,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            derived_documents: Vec::new(),
            outcome: None,
            error: None,
            revision: 0,
        }
    }

    pub fn total_steps(&self) -> u32 {
        self.operations.len() as u32
    }

    pub fn current_operation(&self) -> Option<&Operation> {
        self.operations.get(self.cursor as usize)
    }

    pub fn current_step_key(&self) -> StepKey {
        StepKey::new(self.id, self.cursor)
    }

    /// Client-facing view of this job.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            state: self.state,
            step_cursor: self.cursor,
            total_steps: self.total_steps(),
            cancel_requested: self.cancel_requested,
            outcome: self.outcome.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Response to a job status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub step_cursor: u32,
    pub total_steps: u32,
    pub cancel_requested: bool,
    pub outcome: Option<JobOutcome>,
    pub error: Option<JobError>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Steps and wire messages
// ---------------------------------------------------------------------------

/// `(jobId, stepIndex)`: the idempotency key used to discard duplicate results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub job_id: JobId,
    pub step_index: u32,
}

impl StepKey {
    pub fn new(job_id: JobId, step_index: u32) -> Self {
        Self { job_id, step_index }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.job_id, self.step_index)
    }
}

impl std::str::FromStr for StepKey {
    type Err = PagewerkError;

    fn from_str(s: &str) -> Result<Self> {
        let (job, step) = s
            .rsplit_once(':')
            .ok_or_else(|| PagewerkError::Validation(format!("malformed step key {s:?}")))?;
        let step_index = step
            .parse()
            .map_err(|e| PagewerkError::Validation(format!("malformed step index {step:?}: {e}")))?;
        Ok(Self::new(job.parse()?, step_index))
    }
}

/// Runtime state of a dispatched step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Dispatched,
    Committed,
    Failed,
}

/// One operation bound to the document version it expects to apply against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub key: StepKey,
    pub operation: Operation,
    pub input_document: DocumentId,
    pub input_version: Version,
    /// One-based attempt counter.
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub status: StepStatus,
    pub committed_version: Option<Version>,
}

/// The message placed on the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub job_id: JobId,
    pub step_index: u32,
    pub attempt: u32,
    pub operation_kind: OperationKind,
    pub operation_parameters: serde_json::Value,
    pub input_document_id: DocumentId,
    pub input_version: Version,
    /// Blobs the executor may need to resolve.
    #[serde(default)]
    pub blobs: Vec<BlobRef>,
    pub deadline: DateTime<Utc>,
    pub idempotency_key: String,
}

impl WorkItem {
    /// Build the queue message for a step.
    pub fn for_step(step: &Step, blobs: Vec<BlobRef>) -> Result<Self> {
        let (operation_kind, operation_parameters) = step.operation.to_parts()?;
        Ok(Self {
            job_id: step.key.job_id,
            step_index: step.key.step_index,
            attempt: step.attempt,
            operation_kind,
            operation_parameters,
            input_document_id: step.input_document,
            input_version: step.input_version,
            blobs,
            deadline: step.deadline,
            idempotency_key: step.key.to_string(),
        })
    }

    pub fn step_key(&self) -> StepKey {
        StepKey::new(self.job_id, self.step_index)
    }

    pub fn operation(&self) -> Result<Operation> {
        Operation::from_parts(self.operation_kind, self.operation_parameters.clone())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// A content replacement produced by a content-level step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageArtifact {
    pub page_id: PageId,
    pub blob: BlobRef,
}

/// Successful output of one step execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    /// The target's page sequence after the step.
    pub new_page_sequence: Vec<PageRef>,
    #[serde(default)]
    pub derived_documents: Vec<DerivedDocument>,
    /// Blob replacements, kept so the step can be reapplied after a conflict
    /// without repeating external work.
    #[serde(default)]
    pub artifacts: Vec<PageArtifact>,
}

/// Typed failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success(StepOutput),
    Failure(StepFailure),
}

/// Result message reported for a work item, correlated by idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub job_id: JobId,
    pub step_index: u32,
    pub attempt: u32,
    pub idempotency_key: String,
    pub outcome: StepOutcome,
}

impl StepResult {
    pub fn success(item: &WorkItem, output: StepOutput) -> Self {
        Self::with_outcome(item, StepOutcome::Success(output))
    }

    pub fn failure(item: &WorkItem, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::with_outcome(
            item,
            StepOutcome::Failure(StepFailure {
                kind,
                message: message.into(),
            }),
        )
    }

    fn with_outcome(item: &WorkItem, outcome: StepOutcome) -> Self {
        Self {
            job_id: item.job_id,
            step_index: item.step_index,
            attempt: item.attempt,
            idempotency_key: item.idempotency_key.clone(),
            outcome,
        }
    }

    pub fn step_key(&self) -> StepKey {
        StepKey::new(self.job_id, self.step_index)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success(_))
    }
}
