// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! pagewerk-executor: the operation executor interface, its built-in and
//! delegating implementations, and the worker loop that runs them.
//!
//! Executors are deterministic: given the same input page sequence and
//! parameters they produce the same output, so running a redelivered work
//! item twice is harmless.

pub mod builtin;
pub mod content;
pub mod executor;
pub mod registry;
pub mod worker;

pub use executor::{ExecutionInput, OperationExecutor};
pub use registry::ExecutorRegistry;
pub use worker::Worker;
