//! Per-integration token-bucket limiter (spec.md §4.2).
//!
//! One bucket per integration id, burst capacity of exactly one token,
//! refilling every `60 / rate_per_minute` seconds. A plain `Instant` guarded
//! by a mutex is all the state a burst-1 bucket needs — the rate has to be
//! replaceable in place and readable back out for `stats()`, which doesn't
//! fit a fixed-quota limiter cleanly, so this stays hand-rolled rather than
//! wrapping one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A missing or non-positive rate still yields one send per minute rather
/// than a bucket that can never open (spec.md §8 property 11).
const MIN_RATE_PER_MINUTE: i64 = 1;

/// These mutexes only ever guard a plain `Duration`/`Instant` swap with no
/// panicking code in between, so a poisoned lock still holds a perfectly
/// usable value — recover it instead of propagating the poison.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn normalize_rate(rate_per_minute: i64) -> i64 {
    rate_per_minute.max(MIN_RATE_PER_MINUTE)
}

fn interval_for(rate_per_minute: i64) -> Duration {
    Duration::from_secs_f64(60.0 / rate_per_minute as f64)
}

/// Single-token bucket for one integration.
pub struct Bucket {
    rate_per_minute: AtomicI64,
    interval: Mutex<Duration>,
    next_at: Mutex<Instant>,
}

impl Bucket {
    fn new(rate_per_minute: i64) -> Self {
        let rate = normalize_rate(rate_per_minute);
        Bucket {
            rate_per_minute: AtomicI64::new(rate),
            interval: Mutex::new(interval_for(rate)),
            next_at: Mutex::new(Instant::now()),
        }
    }

    fn rate(&self) -> i64 {
        self.rate_per_minute.load(Ordering::Relaxed)
    }

    fn set_rate(&self, rate_per_minute: i64) {
        let rate = normalize_rate(rate_per_minute);
        if self.rate_per_minute.swap(rate, Ordering::Relaxed) != rate {
            *lock(&self.interval) = interval_for(rate);
        }
    }

    /// Take the single token if it's available right now; otherwise report
    /// how long until it will be.
    fn try_take(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let interval = *lock(&self.interval);
        let mut next_at = lock(&self.next_at);
        if now >= *next_at {
            *next_at = now + interval;
            Ok(())
        } else {
            Err(*next_at - now)
        }
    }

    fn tokens_available(&self) -> u32 {
        if Instant::now() >= *lock(&self.next_at) {
            1
        } else {
            0
        }
    }
}

/// Snapshot of one bucket's configuration and current fill state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimiterStats {
    pub rate_per_second: f64,
    pub rate_per_minute: i64,
    pub tokens_available: u32,
    pub burst: u32,
}

/// Result of a non-blocking reservation attempt.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub ok: bool,
    pub delay: Duration,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled,
}

/// Concurrent map of per-integration token buckets.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Fetch the bucket for `integration_id`, creating it with `rate_per_minute`
    /// if absent, and updating its rate in place if it already exists.
    pub fn get_or_create(&self, integration_id: &str, rate_per_minute: i64) -> Arc<Bucket> {
        let rate = normalize_rate(rate_per_minute);
        let entry = self
            .buckets
            .entry(integration_id.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(rate)));
        entry.set_rate(rate);
        entry.clone()
    }

    /// Block until a token is available, or `cancel` fires.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        integration_id: &str,
        rate_per_minute: i64,
    ) -> Result<(), WaitError> {
        let bucket = self.get_or_create(integration_id, rate_per_minute);
        loop {
            match bucket.try_take() {
                Ok(()) => return Ok(()),
                Err(delay) => {
                    tracing::debug!(integration_id, delay_ms = delay.as_millis() as u64, "rate limiter waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                    }
                }
            }
        }
    }

    /// Non-blocking: take the token if available, report false otherwise.
    pub fn allow(&self, integration_id: &str, rate_per_minute: i64) -> bool {
        let bucket = self.get_or_create(integration_id, rate_per_minute);
        bucket.try_take().is_ok()
    }

    /// Non-blocking: same as `allow`, but returns how long the caller would
    /// have had to wait on failure.
    pub fn reserve(&self, integration_id: &str, rate_per_minute: i64) -> Reservation {
        let bucket = self.get_or_create(integration_id, rate_per_minute);
        match bucket.try_take() {
            Ok(()) => Reservation {
                ok: true,
                delay: Duration::ZERO,
            },
            Err(delay) => Reservation { ok: false, delay },
        }
    }

    pub fn stats(&self) -> HashMap<String, RateLimiterStats> {
        self.buckets
            .iter()
            .map(|entry| {
                let rate = entry.rate();
                let stats = RateLimiterStats {
                    rate_per_second: rate as f64 / 60.0,
                    rate_per_minute: rate,
                    tokens_available: entry.tokens_available(),
                    burst: 1,
                };
                (entry.key().clone(), stats)
            })
            .collect()
    }

    pub fn remove(&self, integration_id: &str) {
        self.buckets.remove(integration_id);
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}
