// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Pagewerk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Version;

/// Classification recorded on failed jobs and carried in result messages.
///
/// Drives the orchestrator's retry decisions: only `TransientWorker` and
/// `Conflict` are ever retried, everything else fails the job on first sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed operation or unknown page/document id at admission.
    Validation,
    /// Optimistic commit lost a race more times than the retry ceiling allows.
    Conflict,
    /// Timeout, worker crash or temporarily unavailable resource.
    TransientWorker,
    /// The operation cannot apply to the current page state.
    PermanentOperation,
    /// This replica is no longer authoritative for the document.
    LeaseLost,
    /// A referenced blob was evicted or never existed.
    BlobNotFound,
}

impl ErrorKind {
    /// Whether a step failing with this kind may be redispatched.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientWorker)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::TransientWorker => "transient_worker",
            Self::PermanentOperation => "permanent_operation",
            Self::LeaseLost => "lease_lost",
            Self::BlobNotFound => "blob_not_found",
        };
        f.write_str(label)
    }
}

/// Top-level error type for all Pagewerk operations.
#[derive(Debug, Error)]
pub enum PagewerkError {
    // -- Job lifecycle --
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: Version, actual: Version },

    #[error("transient worker failure: {0}")]
    TransientWorker(String),

    #[error("operation cannot be applied: {0}")]
    PermanentOperation(String),

    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    // -- Lookups --
    #[error("document {0} not found")]
    DocumentNotFound(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("blob {0} not found")]
    BlobNotFound(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    // -- Collaborators --
    #[error("external collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    // -- Storage / transport --
    #[error("database error: {0}")]
    Database(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PagewerkError {
    /// Map this error onto the job-level taxonomy.
    ///
    /// Infrastructure failures (database, queue, I/O) are treated as
    /// transient: the step is safe to run again because nothing was committed.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::DocumentNotFound(_) | Self::JobNotFound(_) => {
                ErrorKind::Validation
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::LeaseLost(_) => ErrorKind::LeaseLost,
            Self::BlobNotFound(_) => ErrorKind::BlobNotFound,

            Self::PermanentOperation(_)
            | Self::InvalidTransition(_)
            | Self::IntegrityMismatch { .. }
            | Self::CollaboratorUnavailable(_)
            | Self::Serialization(_)
            | Self::Config(_) => ErrorKind::PermanentOperation,

            Self::TransientWorker(_) | Self::Database(_) | Self::Queue(_) => {
                ErrorKind::TransientWorker
            }

            Self::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::BlobNotFound,
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidData => {
                    ErrorKind::PermanentOperation
                }
                _ => ErrorKind::TransientWorker,
            },
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PagewerkError>;
