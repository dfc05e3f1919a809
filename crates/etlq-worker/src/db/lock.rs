//! Lease-style distributed lock on the `etl_locks` table

use std::time::Duration;

use async_trait::async_trait;
use etlq_common::logging::SQL_TARGET;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::store::DistributedLock;

/// Holder identity for this process: `<hostname>-<uuid>`
fn owner_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}-{}", host, Uuid::new_v4())
}

#[derive(Debug, Clone)]
pub struct PgLock {
    pool: PgPool,
    owner: String,
}

impl PgLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            owner: owner_id(),
        }
    }
}

#[async_trait]
impl DistributedLock for PgLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        // Take the key when it is free, expired, or already ours
        let query = "INSERT INTO etl_locks (key, owner, acquired_at, expires_at) \
                     VALUES ($1, $2, now(), now() + make_interval(secs => $3)) \
                     ON CONFLICT (key) DO UPDATE SET \
                         owner = EXCLUDED.owner, \
                         acquired_at = EXCLUDED.acquired_at, \
                         expires_at = EXCLUDED.expires_at \
                     WHERE etl_locks.expires_at <= now() OR etl_locks.owner = EXCLUDED.owner \
                     RETURNING key";
        debug!(target: SQL_TARGET, key, owner = %self.owner, ttl_secs = ttl.as_secs(), "[UPSERT] {}", query);

        let acquired: Option<String> = sqlx::query_scalar(query)
            .bind(key)
            .bind(&self.owner)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        Ok(acquired.is_some())
    }

    async fn release(&self, key: &str) -> StoreResult<()> {
        let query = "DELETE FROM etl_locks WHERE key = $1 AND owner = $2";
        debug!(target: SQL_TARGET, key, owner = %self.owner, "[DELETE] {}", query);

        sqlx::query(query)
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
