//! `RetryPolicy`: pure mapping from attempt number to the next retry time.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Computes `next_retry_at` for a given attempt count.
///
/// Implementations must guarantee `next(a+1) >= next(a)` and
/// `next(a) <= now + max_backoff` for all `a >= 1` (spec.md §4.6 / §8
/// property 5).
pub trait RetryPolicy: Send + Sync {
    fn next(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// `min(base * 2^(attempt-1), max_backoff)`, the typical implementation
/// spec.md §4.6 suggests.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: ChronoDuration,
    pub max_backoff: ChronoDuration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: ChronoDuration::seconds(1),
            max_backoff: ChronoDuration::minutes(30),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: ChronoDuration, max_backoff: ChronoDuration) -> Self {
        Self { base, max_backoff }
    }

    fn backoff_for(&self, attempt: i32) -> ChronoDuration {
        let attempt = attempt.max(1);
        // Saturate the exponent rather than overflow for pathologically
        // large attempt counts; 2^30 seconds already dwarfs any sane cap.
        let exp = (attempt - 1).min(30) as u32;
        let multiplier = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let scaled = self
            .base
            .num_milliseconds()
            .saturating_mul(multiplier as i64);
        ChronoDuration::milliseconds(scaled).min(self.max_backoff)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.backoff_for(attempt)
    }
}
