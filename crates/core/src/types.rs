//! Core domain models for the email dispatch engine.
//!
//! These types represent the entities a tenant's queue and history tables
//! hold; `relaycore-store` maps them onto Postgres rows, but nothing in this
//! module depends on a database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a queue entry originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Broadcast,
    Automation,
}

/// Lifecycle state of an `EmailQueueEntry`.
///
/// `Sent` is transient: the store deletes sent rows immediately, so the only
/// states a caller ever observes on a fetched row are `Pending` and
/// `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
}

/// ESP a tenant's integration is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ses,
    Postmark,
    Mailgun,
    Mailjet,
    SparkPost,
    Smtp,
}

/// Optional per-message envelope overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailOptions {
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    /// Overrides the integration's configured sender name when non-empty.
    pub from_name_override: Option<String>,
}

/// The composed, ready-to-send content stored alongside a queue entry.
///
/// Template rendering happens upstream (out of scope here); by the time a
/// row reaches the queue, `html_content` is already fully composed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    pub from_address: String,
    pub from_name: String,
    pub subject: String,
    pub html_content: String,
    #[serde(default)]
    pub email_options: Option<EmailOptions>,
    /// Broadcast audience list, present only for broadcast sources.
    pub list_id: Option<String>,
    /// Per-message rate override; takes precedence over the integration's.
    pub rate_limit_per_minute: Option<i64>,
    pub template_version: i32,
}

/// A durable, per-tenant unit of delivery work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailQueueEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub message_id: String,
    pub status: QueueStatus,
    pub source_type: SourceType,
    pub source_id: String,
    pub integration_id: String,
    pub contact_email: String,
    pub template_id: String,
    pub payload: EmailPayload,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The durable, idempotent observability record keyed by `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHistoryRecord {
    pub message_id: String,
    pub tenant_id: Uuid,
    pub contact_email: String,
    pub template_id: String,
    pub template_version: i32,
    pub channel: String,
    /// Encrypted structured blob (see `relaycore-store::encryption`).
    pub message_data: Vec<u8>,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_type: SourceType,
    pub source_id: String,
    pub list_id: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Truncated to 255 chars; see `truncate_status_info`.
    pub status_info: Option<String>,
}

/// Maximum length of `status_info`, per spec.md §3.
pub const STATUS_INFO_MAX_LEN: usize = 255;

/// Truncate an error string to the history row's `status_info` limit.
///
/// Truncation happens on character boundaries so multi-byte UTF-8 text is
/// never cut mid-codepoint.
pub fn truncate_status_info(err: &str) -> String {
    match err.char_indices().nth(STATUS_INFO_MAX_LEN) {
        Some((byte_idx, _)) => err[..byte_idx].to_string(),
        None => err.to_string(),
    }
}

/// An ESP binding on a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailProvider {
    pub kind: ProviderKind,
    pub rate_limit_per_minute: Option<i64>,
    pub default_from_name: String,
    /// Opaque to the core; passed straight through to the `Sender` adapter.
    pub credentials: serde_json::Value,
}

/// A tenant's integration binding. Only `Email` integrations are relevant to
/// this core; other integration types are represented as `None` providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub email_provider: Option<EmailProvider>,
}

/// A tenant (workspace): owns zero or more integrations and a queue/history
/// pair. Read-only to this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub secret_key: String,
    pub integrations: Vec<Integration>,
}

impl Tenant {
    pub fn integration_by_id(&self, id: &str) -> Option<&Integration> {
        self.integrations.iter().find(|i| i.id == id)
    }

    /// Minimum `rate_limit_per_minute` across this tenant's email
    /// integrations, or 60 if none declare one. Used to size the dynamic
    /// batch (spec.md §4.5 step 1).
    pub fn min_email_rate_per_minute(&self) -> i64 {
        self.integrations
            .iter()
            .filter_map(|i| i.email_provider.as_ref())
            .filter_map(|p| p.rate_limit_per_minute)
            .filter(|r| *r > 0)
            .min()
            .unwrap_or(60)
    }
}

/// The request a `Sender` adapter translates into an ESP-specific API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailProviderRequest {
    pub tenant_id: Uuid,
    pub integration_id: String,
    pub message_id: String,
    pub from_address: String,
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub html_content: String,
    pub provider: EmailProvider,
    pub email_options: Option<EmailOptions>,
}
