//! relaycore-worker — the WorkerPool that ties QueueStore, RateLimiter,
//! CircuitBreaker, Sender and MessageHistoryStore together (spec.md §4.5).

mod pool;

pub use pool::WorkerPool;

#[cfg(test)]
mod tests;
