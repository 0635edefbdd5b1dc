//! relaycore-store — Postgres-backed implementations of the trait
//! boundaries `relaycore-core` defines, plus the one piece of ambient
//! infrastructure every caller needs: a connection pool.

pub mod encryption;
pub mod history;
pub mod queue;
pub mod registry;

pub use history::PgMessageHistoryStore;
pub use queue::{NewQueueEntry, PgQueueStore};
pub use registry::PgTenantRegistry;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Open a pooled connection to `database_url`. Mirrors the pool knobs a
/// production deployment embedding this crate would want — short acquire
/// timeout so the worker fails fast rather than wedging on a starved pool.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "database pool established");
    Ok(pool)
}
