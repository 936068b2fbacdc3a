use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{BreakerRecord, BreakerStore};
use crate::error::AppResult;

/// Postgres breaker-state store. State is advisory health aggregation;
/// last-writer-wins on concurrent updates is acceptable here, unlike the
/// ledger and reservation paths.
pub struct PgBreakerStore {
    pool: PgPool,
}

impl PgBreakerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: PgRow) -> AppResult<BreakerRecord> {
        let failure_count: i32 = row.try_get("failure_count")?;
        let success_count: i32 = row.try_get("success_count")?;
        Ok(BreakerRecord {
            key: row.try_get("key")?,
            state: row.try_get("state")?,
            failure_count: failure_count.max(0) as u32,
            success_count: success_count.max(0) as u32,
            last_failure_at: row.try_get::<Option<DateTime<Utc>>, _>("last_failure_at")?,
            opened_at: row.try_get::<Option<DateTime<Utc>>, _>("opened_at")?,
        })
    }
}

#[async_trait]
impl BreakerStore for PgBreakerStore {
    async fn load(&self, key: &str) -> AppResult<Option<BreakerRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, state, failure_count, success_count, last_failure_at, opened_at
            FROM circuit_breaker_state
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::from_row).transpose()
    }

    async fn save(&self, record: &BreakerRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_state
                (key, state, failure_count, success_count, last_failure_at, opened_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO UPDATE
            SET state = EXCLUDED.state,
                failure_count = EXCLUDED.failure_count,
                success_count = EXCLUDED.success_count,
                last_failure_at = EXCLUDED.last_failure_at,
                opened_at = EXCLUDED.opened_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.key)
        .bind(record.state)
        .bind(record.failure_count as i32)
        .bind(record.success_count as i32)
        .bind(record.last_failure_at)
        .bind(record.opened_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
