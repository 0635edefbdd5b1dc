//! Postgres-backed `MessageHistoryStore` (spec.md §4.5/§3).
//!
//! History rows are upserted, never deleted — the queue is ephemeral work,
//! history is the permanent record (spec.md §7). `message_data` is encrypted
//! with a key derived from the tenant's `secret_key` before it ever reaches
//! the connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycore_core::{
    truncate_status_info, HistoryOutcome, HistoryUpsert, MessageHistoryStore, SourceType,
    StoreError,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::encryption;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn source_type_str(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Broadcast => "broadcast",
        SourceType::Automation => "automation",
    }
}

pub struct PgMessageHistoryStore {
    pool: PgPool,
}

impl PgMessageHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageHistoryStore for PgMessageHistoryStore {
    async fn upsert(
        &self,
        tenant_id: Uuid,
        secret_key: &str,
        record: HistoryUpsert,
    ) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(&record.message_data)
            .map_err(|e| StoreError::Backend(format!("serializing message_data: {e}")))?;
        let encrypted = encryption::encrypt(secret_key, &plaintext)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let (failed_at, status_info): (Option<DateTime<Utc>>, Option<String>) =
            match &record.outcome {
                HistoryOutcome::Success => (None, None),
                HistoryOutcome::Failure { status_info } => {
                    (Some(Utc::now()), Some(truncate_status_info(status_info)))
                }
            };

        sqlx::query(
            r#"
            INSERT INTO message_history
                (tenant_id, message_id, contact_email, template_id, template_version,
                 channel, message_data, sent_at, source_type, source_id, list_id,
                 failed_at, status_info, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, 'email', $6, $7, $8, $9, $10, $11, $12, now(), now())
            ON CONFLICT (tenant_id, message_id) DO UPDATE SET
                contact_email = EXCLUDED.contact_email,
                template_id = EXCLUDED.template_id,
                template_version = EXCLUDED.template_version,
                message_data = EXCLUDED.message_data,
                sent_at = EXCLUDED.sent_at,
                source_type = EXCLUDED.source_type,
                source_id = EXCLUDED.source_id,
                list_id = EXCLUDED.list_id,
                failed_at = EXCLUDED.failed_at,
                status_info = EXCLUDED.status_info,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(&record.message_id)
        .bind(&record.contact_email)
        .bind(&record.template_id)
        .bind(record.template_version)
        .bind(&encrypted)
        .bind(record.sent_at)
        .bind(source_type_str(record.source_type))
        .bind(&record.source_id)
        .bind(&record.list_id)
        .bind(failed_at)
        .bind(&status_info)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(())
    }
}
