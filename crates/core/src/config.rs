//! `WorkerConfig`: the knobs enumerated in spec.md §6, each with its default.
//!
//! This is not a general configuration-loading layer (that collaborator is
//! out of scope per spec.md §1) — only the one environment override spec.md
//! §6 names explicitly (`CIRCUIT_BREAKER_COOLDOWN`) is read here.

use std::time::Duration;

use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retries: i32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub send_timeout: Duration,
    pub processing_recovery_age: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            max_retries: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
            processing_recovery_age: Duration::from_secs(5 * 60),
        }
    }
}

impl WorkerConfig {
    /// Overlay `CIRCUIT_BREAKER_COOLDOWN` from the environment if set and
    /// parseable as a plain integer number of seconds. Any other value is
    /// left at its default/caller-supplied value.
    pub fn apply_env_overrides(mut self) -> Result<Self, DispatchError> {
        if let Ok(raw) = std::env::var("CIRCUIT_BREAKER_COOLDOWN") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                DispatchError::Config(format!("CIRCUIT_BREAKER_COOLDOWN must be an integer number of seconds, got {raw:?}"))
            })?;
            self.circuit_breaker_cooldown = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// The dynamic batch size for a tenant given its slowest integration's
    /// rate (spec.md §4.5 step 2): enough to keep ~45s of work in flight,
    /// clamped to `[1, batch_size]`.
    pub fn effective_batch(&self, min_rate_per_minute: i64) -> i64 {
        let dynamic = (min_rate_per_minute.max(1) * 45) / 60;
        dynamic.clamp(1, self.batch_size.max(1))
    }
}
