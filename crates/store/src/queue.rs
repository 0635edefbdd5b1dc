//! Postgres-backed `QueueStore` (spec.md §4.4).
//!
//! The conditional `UPDATE ... WHERE status = 'pending'` in `mark_processing`
//! is the sole concurrency barrier: it is linearisable at the database layer
//! so two workers racing on the same row never both succeed, mirroring
//! `fetch_pending_messages`/`mark_completed` in the teacher's own worker db
//! module, split into a read-only fetch and a separately-claimed update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycore_core::{
    EmailPayload, EmailQueueEntry, QueueStatus, QueueStore, SourceType, StoreError,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_status(raw: &str) -> Result<QueueStatus, StoreError> {
    match raw {
        "pending" => Ok(QueueStatus::Pending),
        "processing" => Ok(QueueStatus::Processing),
        other => Err(StoreError::Backend(format!("unknown queue status {other:?}"))),
    }
}

fn parse_source_type(raw: &str) -> Result<SourceType, StoreError> {
    match raw {
        "broadcast" => Ok(SourceType::Broadcast),
        "automation" => Ok(SourceType::Automation),
        other => Err(StoreError::Backend(format!("unknown source type {other:?}"))),
    }
}

fn source_type_str(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Broadcast => "broadcast",
        SourceType::Automation => "automation",
    }
}

#[derive(Debug, FromRow)]
struct QueueRow {
    id: Uuid,
    tenant_id: Uuid,
    message_id: String,
    status: String,
    source_type: String,
    source_id: String,
    integration_id: String,
    contact_email: String,
    template_id: String,
    payload: sqlx::types::Json<EmailPayload>,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for EmailQueueEntry {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(EmailQueueEntry {
            id: row.id,
            tenant_id: row.tenant_id,
            message_id: row.message_id,
            status: parse_status(&row.status)?,
            source_type: parse_source_type(&row.source_type)?,
            source_id: row.source_id,
            integration_id: row.integration_id,
            contact_email: row.contact_email,
            template_id: row.template_id,
            payload: row.payload.0,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

/// One row to insert into `email_queue`. Separate from `EmailQueueEntry`
/// because callers never supply `id`/`attempts`/`status` directly.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub tenant_id: Uuid,
    pub message_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub integration_id: String,
    pub contact_email: String,
    pub template_id: String,
    pub payload: EmailPayload,
    pub max_attempts: i32,
}

pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new pending row, eligible for `fetch_pending` immediately.
    /// Not part of the `QueueStore` trait (spec.md doesn't name an enqueue
    /// operation on the trait itself) but needed by anything feeding this
    /// store, including the test suite below.
    pub async fn enqueue(&self, entry: NewQueueEntry) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO email_queue
                (id, tenant_id, message_id, status, source_type, source_id,
                 integration_id, contact_email, template_id, payload,
                 attempts, max_attempts, next_retry_at, created_at, updated_at)
            VALUES
                ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, 0, $10, now(), now(), now())
            "#,
        )
        .bind(id)
        .bind(entry.tenant_id)
        .bind(&entry.message_id)
        .bind(source_type_str(entry.source_type))
        .bind(&entry.source_id)
        .bind(&entry.integration_id)
        .bind(&entry.contact_email)
        .bind(&entry.template_id)
        .bind(sqlx::types::Json(&entry.payload))
        .bind(entry.max_attempts)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(id)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn fetch_pending(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> Result<Vec<EmailQueueEntry>, StoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, message_id, status, source_type, source_id,
                   integration_id, contact_email, template_id, payload,
                   attempts, max_attempts, next_retry_at, last_error, created_at
            FROM email_queue
            WHERE tenant_id = $1 AND status = 'pending' AND next_retry_at <= now()
            ORDER BY next_retry_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_processing(&self, tenant_id: Uuid, entry_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'processing', attempts = attempts + 1, updated_at = now()
            WHERE id = $1 AND tenant_id = $2 AND status = 'pending'
            "#,
        )
        .bind(entry_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyClaimed);
        }
        Ok(())
    }

    async fn mark_sent(&self, tenant_id: Uuid, entry_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM email_queue WHERE id = $1 AND tenant_id = $2")
            .bind(entry_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        tenant_id: Uuid,
        entry_id: Uuid,
        err: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'pending', last_error = $3, next_retry_at = $4, updated_at = now()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(entry_id)
        .bind(tenant_id)
        .bind(err)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn set_next_retry(
        &self,
        tenant_id: Uuid,
        entry_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET next_retry_at = $3, updated_at = now()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(entry_id)
        .bind(tenant_id)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, tenant_id: Uuid, entry_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM email_queue WHERE id = $1 AND tenant_id = $2")
            .bind(entry_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn recover_stale_processing(
        &self,
        tenant_id: Uuid,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'pending', updated_at = now()
            WHERE tenant_id = $1 AND status = 'processing' AND updated_at < $2
            "#,
        )
        .bind(tenant_id)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(result.rows_affected())
    }
}
