// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PagewerkError, Result};

/// File name of the persisted configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Persistent engine settings.
///
/// Unknown or missing fields fall back to their defaults, so a partially
/// written `config.json` still loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts allowed per step before a transient failure becomes permanent.
    pub max_step_attempts: u32,
    /// Optimistic-commit reapplications before a step fails with `Conflict`.
    pub conflict_retry_limit: u32,
    /// Base delay for exponential backoff between step attempts.
    pub retry_base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    pub retry_max_delay_ms: u64,
    /// Time a worker has to finish a step before it is treated as lost.
    pub step_timeout_secs: u64,
    /// Document lease lifetime; renewed on every commit and tick.
    pub lease_ttl_secs: u64,
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout_secs: u64,
    /// Deliveries after which a message is moved to the dead-letter store.
    pub max_deliveries: u32,
    /// Idle sleep between queue polls.
    pub poll_interval_ms: u64,
    /// Worker tasks started by `serve`.
    pub worker_count: usize,
    /// Largest blob accepted by the resolver.
    pub max_blob_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 5,
            conflict_retry_limit: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            step_timeout_secs: 300,
            lease_ttl_secs: 60,
            visibility_timeout_secs: 120,
            max_deliveries: 5,
            poll_interval_ms: 200,
            worker_count: 4,
            max_blob_bytes: 100 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_step_attempts == 0 {
            return Err(PagewerkError::Config(
                "max_step_attempts must be at least 1".into(),
            ));
        }
        if self.max_deliveries == 0 {
            return Err(PagewerkError::Config("max_deliveries must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(PagewerkError::Config("worker_count must be at least 1".into()));
        }
        if self.lease_ttl_secs == 0 || self.step_timeout_secs == 0 {
            return Err(PagewerkError::Config(
                "lease_ttl_secs and step_timeout_secs must be non-zero".into(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(PagewerkError::Config(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }

    /// Load `config.json` from `data_dir`, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(_) => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "ignoring malformed config: {e}");
                Self::default()
            }
        }
    }

    /// Write this configuration as pretty JSON into `data_dir`.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}
