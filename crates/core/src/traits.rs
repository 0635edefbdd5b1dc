//! External interfaces the worker consumes (spec.md §6).
//!
//! These are the seams `relaycore-worker` is tested against: fakes for every
//! trait here live in `relaycore-worker`'s test module, so the state machine
//! in §4.5 can be exercised without a database or network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{EmailQueueEntry, SendEmailProviderRequest, SourceType, Tenant};

/// Errors a store implementation can report back to the worker.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// `mark_processing` found the row already claimed (or gone) — the
    /// conditional update affected zero rows. Never retried by the caller;
    /// the worker simply moves on to the next entry.
    #[error("entry already claimed")]
    AlreadyClaimed,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Per-tenant durable queue of `EmailQueueEntry` rows (spec.md §4.4).
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn fetch_pending(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> Result<Vec<EmailQueueEntry>, StoreError>;

    async fn mark_processing(&self, tenant_id: Uuid, entry_id: Uuid) -> Result<(), StoreError>;

    async fn mark_sent(&self, tenant_id: Uuid, entry_id: Uuid) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        tenant_id: Uuid,
        entry_id: Uuid,
        err: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_next_retry(
        &self,
        tenant_id: Uuid,
        entry_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, tenant_id: Uuid, entry_id: Uuid) -> Result<(), StoreError>;

    /// Reset `Processing` rows stuck since before `older_than` back to
    /// `Pending`, without touching `attempts` (spec.md §5 recovery policy).
    /// Returns the number of rows reset.
    async fn recover_stale_processing(
        &self,
        tenant_id: Uuid,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Outcome of a single delivery attempt, as recorded in history.
#[derive(Debug, Clone)]
pub enum HistoryOutcome {
    Success,
    Failure { status_info: String },
}

/// The plaintext fields `MessageHistoryStore::upsert` needs; the store
/// implementation is responsible for encrypting `message_data` with a key
/// derived from the tenant's `secret_key` before it touches disk.
#[derive(Debug, Clone)]
pub struct HistoryUpsert {
    pub message_id: String,
    pub contact_email: String,
    pub template_id: String,
    pub template_version: i32,
    pub message_data: serde_json::Value,
    pub sent_at: DateTime<Utc>,
    pub source_type: SourceType,
    pub source_id: String,
    pub list_id: Option<String>,
    pub outcome: HistoryOutcome,
}

/// Per-tenant append/upsert observability store (spec.md §4.5 / §3).
#[async_trait]
pub trait MessageHistoryStore: Send + Sync {
    async fn upsert(
        &self,
        tenant_id: Uuid,
        secret_key: &str,
        record: HistoryUpsert,
    ) -> Result<(), StoreError>;
}

/// Read-only lister/resolver of tenants (spec.md §6).
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<Tenant>, StoreError>;
    async fn get(&self, tenant_id: Uuid) -> Result<Option<Tenant>, StoreError>;
}

/// A raw send failure from a `Sender` adapter. Preserves the original text
/// verbatim so `ErrorClassifier` can pattern-match on it.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct SendError(pub String);

/// Abstraction over ESP-specific clients (spec.md §4.7). Knows nothing about
/// retries, rate limits, or circuit breakers.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, request: SendEmailProviderRequest) -> Result<(), SendError>;
}

/// Optional fire-and-forget observers (spec.md §4.8). Implementations must
/// not block; anything heavier should post to their own queue.
pub trait ProgressCallbacks: Send + Sync {
    fn on_email_sent(
        &self,
        tenant_id: Uuid,
        source_type: SourceType,
        source_id: &str,
        message_id: &str,
    );

    fn on_email_failed(
        &self,
        tenant_id: Uuid,
        source_type: SourceType,
        source_id: &str,
        message_id: &str,
        err: &str,
        permanent: bool,
    );
}

/// A no-op set of callbacks, used when the caller doesn't need progress
/// tracking.
pub struct NoopCallbacks;

impl ProgressCallbacks for NoopCallbacks {
    fn on_email_sent(&self, _: Uuid, _: SourceType, _: &str, _: &str) {}
    fn on_email_failed(&self, _: Uuid, _: SourceType, _: &str, _: &str, _: &str, _: bool) {}
}
