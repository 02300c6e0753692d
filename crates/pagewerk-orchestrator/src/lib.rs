// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! pagewerk-orchestrator: the job state machine.
//!
//! Accepts job requests, serialises jobs per document through durable
//! leases, dispatches one step at a time and reconciles worker results into
//! the page model. All coordination goes through the durable job, step and
//! lease records, so several orchestrator replicas can share one data
//! directory.

pub mod admission;
pub mod job_store;
pub mod lease;
pub mod orchestrator;

pub use job_store::{AttemptOutcome, AttemptRecord, JobStore};
pub use lease::{Lease, LeaseStore};
pub use orchestrator::{EngineHealth, Orchestrator, TickReport};
