// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Queue transport contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagewerk_core::error::Result;
use serde::{Deserialize, Serialize};

/// Handle for one delivery of a message.
///
/// The receipt changes on every delivery, so a token from an earlier
/// delivery cannot acknowledge a later one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryToken {
    pub message_id: i64,
    pub receipt: String,
}

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.message_id, self.receipt)
    }
}

/// A received message, invisible to other consumers until acked, nacked or
/// its visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: DeliveryToken,
    pub payload: String,
    /// How many times this message has been delivered, this delivery included.
    pub delivery_count: u32,
}

/// A message removed from circulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: String,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Message counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Visible now.
    pub ready: u64,
    /// Delayed or currently leased to a consumer.
    pub pending: u64,
    /// Waiting in the dead-letter store.
    pub dead: u64,
}

/// At-least-once message transport with visibility timeouts.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue `payload`; it becomes visible after `delay`.
    async fn publish(&self, queue: &str, payload: &str, delay: Duration) -> Result<()>;

    /// Take the oldest visible message, hiding it for `visibility`.
    ///
    /// Messages that have already been delivered the maximum number of times
    /// are moved to the dead-letter store instead of being returned.
    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>>;

    /// Remove a delivered message. Returns `false` if the token is stale.
    async fn ack(&self, token: &DeliveryToken) -> Result<bool>;

    /// Make a delivered message visible again after `delay`.
    async fn nack(&self, token: &DeliveryToken, delay: Duration) -> Result<bool>;

    /// Move a delivered message straight to the dead-letter store.
    async fn reject(&self, token: &DeliveryToken, reason: &str) -> Result<bool>;

    /// Remove and return up to `limit` dead letters for `queue`, oldest first.
    async fn drain_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}
