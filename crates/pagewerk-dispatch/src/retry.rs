// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounded retry with exponential backoff + jitter for step redispatch.
//
// Only `TransientWorker` failures are retried. Everything else gives up on
// first sight and fails the job with the reported kind.

use std::time::Duration;

use pagewerk_core::{EngineConfig, ErrorKind};
use tracing::{debug, info, warn};

/// Retry ceiling and backoff curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed per step, counting the first.
    pub max_attempts: u32,
    /// Base delay between attempts (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_step_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

/// Outcome of evaluating a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redispatch after this delay.
    RetryAfter(Duration),
    /// Not retriable.
    GiveUp(ErrorKind),
    /// Retriable, but the attempt ceiling has been reached.
    Exhausted,
}

/// Decide what to do after attempt number `attempt` (1-based) failed.
pub fn should_retry(kind: ErrorKind, attempt: u32, policy: &RetryPolicy) -> RetryDecision {
    if !kind.is_transient() {
        info!(%kind, "non-transient failure, not retrying");
        return RetryDecision::GiveUp(kind);
    }
    if attempt >= policy.max_attempts {
        warn!(attempt, max = policy.max_attempts, "retry limit exhausted");
        return RetryDecision::Exhausted;
    }
    let delay = compute_delay(attempt, policy);
    debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
    RetryDecision::RetryAfter(delay)
}

/// delay = min(base * 2^(attempt-1) + jitter, max_delay), jitter in [0, base).
pub fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    let exponent = attempt.saturating_sub(1).min(16);
    let exp_ms = base_ms.saturating_mul(1u64 << exponent);
    let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
    Duration::from_millis(total_ms.min(policy.max_delay.as_millis() as u64))
}

/// Deterministic spread across [0, base) keyed on the attempt number.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = u64::from(attempt).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}
