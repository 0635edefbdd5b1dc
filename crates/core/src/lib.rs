//! relaycore-core — domain types, error classification, retry policy and the
//! trait boundaries the worker pool is built against.
//!
//! This crate performs no I/O. Everything here is pure logic and plain data,
//! the way `televent-core` keeps domain logic free of database/network
//! concerns.

pub mod classifier;
pub mod config;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use classifier::classify;
pub use config::WorkerConfig;
pub use error::{ClassifiedError, DispatchError, ErrorKind};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use traits::{
    HistoryOutcome, HistoryUpsert, MessageHistoryStore, NoopCallbacks, ProgressCallbacks,
    QueueStore, SendError, Sender, StoreError, TenantRegistry,
};
pub use types::{
    truncate_status_info, EmailOptions, EmailPayload, EmailProvider, EmailQueueEntry, Integration,
    MessageHistoryRecord, ProviderKind, QueueStatus, SendEmailProviderRequest, SourceType, Tenant,
    STATUS_INFO_MAX_LEN,
};
