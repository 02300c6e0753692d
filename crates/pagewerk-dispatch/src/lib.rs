// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! pagewerk-dispatch: exactly-once effect over an at-least-once queue.
//!
//! The transport may deliver a work item more than once. Nothing here tries
//! to deduplicate deliveries; executors are deterministic and the
//! orchestrator commits only the first result per `(jobId, stepIndex)`.
//! This crate moves messages, counts deliveries, dead-letters poison
//! messages and computes retry backoff.

pub mod dispatcher;
pub mod retry;
pub mod shutdown;
pub mod sqlite_queue;
pub mod transport;

pub use dispatcher::{Dispatcher, ResultHandler, WorkDelivery};
pub use retry::{RetryDecision, RetryPolicy, should_retry};
pub use shutdown::Shutdown;
pub use sqlite_queue::SqliteQueue;
pub use transport::{DeadLetter, Delivery, DeliveryToken, QueueDepth, QueueTransport};
