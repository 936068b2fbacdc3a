use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{Acquire, Lease, LockManager};
use crate::error::AppResult;

/// Postgres lock manager. The upsert's WHERE clause only steals a row whose
/// lease has expired, so exactly one live holder exists per resource key.
pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn acquire(&self, resource_key: &str, ttl: Duration) -> AppResult<Acquire> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let holder_id = Uuid::new_v4();

        let acquired = sqlx::query(
            r#"
            INSERT INTO lock_records (resource_key, holder_id, acquired_at, expires_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, $3)
            ON CONFLICT (resource_key) DO UPDATE
            SET holder_id = EXCLUDED.holder_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                heartbeat_at = EXCLUDED.heartbeat_at
            WHERE lock_records.expires_at <= EXCLUDED.acquired_at
            "#,
        )
        .bind(resource_key)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if acquired == 1 {
            Ok(Acquire::Acquired(Lease {
                resource_key: resource_key.to_string(),
                holder_id,
            }))
        } else {
            Ok(Acquire::Busy)
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> AppResult<bool> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);

        let renewed = sqlx::query(
            r#"
            UPDATE lock_records
            SET expires_at = $3, heartbeat_at = $4
            WHERE resource_key = $1 AND holder_id = $2 AND expires_at > $4
            "#,
        )
        .bind(&lease.resource_key)
        .bind(lease.holder_id)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(renewed == 1)
    }

    async fn release(&self, lease: Lease) -> AppResult<()> {
        sqlx::query("DELETE FROM lock_records WHERE resource_key = $1 AND holder_id = $2")
            .bind(&lease.resource_key)
            .bind(lease.holder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
