//! Per-integration circuit breaker (spec.md §4.3).
//!
//! Two layers: a single breaker tracking one integration's failure streak,
//! and a manager sharding breakers by integration id. The manager is the
//! only layer that knows about `ClassifiedError` — it applies the filter
//! that keeps one poisoned recipient from tripping the breaker for every
//! other recipient on the same integration.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relaycore_core::ClassifiedError;
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

struct Inner {
    last_failure: Option<Instant>,
    last_error: Option<String>,
}

/// `Inner` only ever holds plain data with no panicking code between lock and
/// unlock, so a poisoned lock still holds a perfectly usable value — recover
/// it instead of propagating the poison.
fn lock(mutex: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Tracks one integration's recent Provider/Unknown failure streak.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: AtomicU32,
    is_open: AtomicBool,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold: if threshold == 0 {
                DEFAULT_THRESHOLD
            } else {
                threshold
            },
            cooldown: if cooldown.is_zero() {
                DEFAULT_COOLDOWN
            } else {
                cooldown
            },
            failures: AtomicU32::new(0),
            is_open: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                last_failure: None,
                last_error: None,
            }),
        }
    }

    /// Unconditionally counts one failure. Callers decide whether a given
    /// error is eligible; this type has no opinion about classification.
    pub fn record_failure(&self, error: Option<&str>) {
        let mut inner = lock(&self.inner);
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        inner.last_failure = Some(Instant::now());
        inner.last_error = error.map(str::to_string);
        if failures >= self.threshold {
            self.is_open.store(true, Ordering::SeqCst);
        }
    }

    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);
        self.failures.store(0, Ordering::SeqCst);
        self.is_open.store(false, Ordering::SeqCst);
        inner.last_failure = None;
        inner.last_error = None;
    }

    /// False when closed. When open, auto-resets exactly once the cooldown
    /// has elapsed since the last failure, then reports closed.
    pub fn is_open(&self) -> bool {
        if !self.is_open.load(Ordering::SeqCst) {
            return false;
        }
        let mut inner = lock(&self.inner);
        if !self.is_open.load(Ordering::SeqCst) {
            return false;
        }
        match inner.last_failure {
            Some(t) if t.elapsed() > self.cooldown => {
                self.is_open.store(false, Ordering::SeqCst);
                self.failures.store(0, Ordering::SeqCst);
                inner.last_error = None;
                inner.last_failure = None;
                false
            }
            _ => true,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner).last_error.clone()
    }
}

/// Snapshot of one breaker's state for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub failures: u32,
    pub threshold: u32,
    pub is_open: bool,
    pub last_error: Option<String>,
}

/// Concurrent map of per-integration breakers.
pub struct CircuitBreakerManager {
    threshold: u32,
    cooldown: Duration,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreakerManager {
            threshold,
            cooldown,
            breakers: DashMap::new(),
        }
    }

    fn get_or_create(&self, integration_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(integration_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.threshold, self.cooldown)))
            .clone()
    }

    pub fn is_open(&self, integration_id: &str) -> bool {
        let breaker = self.get_or_create(integration_id);
        let was_open = breaker.is_open.load(Ordering::SeqCst);
        let open = breaker.is_open();
        if was_open && !open {
            tracing::info!(integration_id, "circuit breaker auto-reset after cooldown");
        }
        open
    }

    pub fn record_success(&self, integration_id: &str) {
        self.get_or_create(integration_id).record_success();
    }

    /// Only Provider/Unknown failures count. Returns whether this call was
    /// actually counted — a recipient-classified or absent error is ignored.
    pub fn record_failure(&self, integration_id: &str, classified: Option<&ClassifiedError>) -> bool {
        let Some(classified) = classified else {
            return false;
        };
        if classified.is_recipient_error() {
            return false;
        }
        let breaker = self.get_or_create(integration_id);
        let was_open = breaker.is_open.load(Ordering::SeqCst);
        breaker.record_failure(Some(&classified.original));
        if !was_open && breaker.is_open.load(Ordering::SeqCst) {
            tracing::warn!(integration_id, failures = breaker.failure_count(), "circuit breaker opened");
        }
        true
    }

    pub fn stats(&self) -> std::collections::HashMap<String, BreakerStats> {
        self.breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                let stats = BreakerStats {
                    failures: breaker.failure_count(),
                    threshold: breaker.threshold,
                    is_open: breaker.is_open.load(Ordering::SeqCst),
                    last_error: breaker.last_error(),
                };
                (entry.key().clone(), stats)
            })
            .collect()
    }

    pub fn remove(&self, integration_id: &str) {
        self.breakers.remove(integration_id);
    }

    pub fn clear(&self) {
        self.breakers.clear();
    }
}
