//! Postgres-backed `TenantRegistry` (spec.md §4.6).
//!
//! Tenants are read-only to this core; `integrations` is stored as a single
//! JSONB array rather than normalized tables, since nothing here ever writes
//! to it — only the worker's SCAN step reads it back out.

use async_trait::async_trait;
use relaycore_core::{StoreError, Tenant, TenantRegistry};
use sqlx::PgPool;
use uuid::Uuid;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    secret_key: String,
    integrations: sqlx::types::Json<Vec<relaycore_core::Integration>>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            secret_key: row.secret_key,
            integrations: row.integrations.0,
        }
    }
}

pub struct PgTenantRegistry {
    pool: PgPool,
}

impl PgTenantRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRegistry for PgTenantRegistry {
    async fn list(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<TenantRow> =
            sqlx::query_as("SELECT id, secret_key, integrations FROM tenants ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn get(&self, tenant_id: Uuid) -> Result<Option<Tenant>, StoreError> {
        let row: Option<TenantRow> =
            sqlx::query_as("SELECT id, secret_key, integrations FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend_err)?;
        Ok(row.map(Tenant::from))
    }
}
