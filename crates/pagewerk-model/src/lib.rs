// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! pagewerk-model: the page model store.
//!
//! A document is a versioned, ordered sequence of pages. [`mutation`] holds
//! the pure functions that transform a page sequence; [`store`] persists the
//! committed sequence and enforces optimistic versioning, so no two
//! mutations can ever commit against the same version.

pub mod mutation;
pub mod store;

pub use mutation::{Mutation, MutationContext};
pub use store::{CommitOutcome, PageModelStore, SqlitePageStore};
