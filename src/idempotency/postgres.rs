use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::{Begin, IdempotencyStore};
use crate::error::AppResult;

/// Postgres idempotency store. The primary-key insert is the atomic
/// check-then-reserve; two workers racing on one key cannot both see `Fresh`.
pub struct PgIdempotencyStore {
    pool: PgPool,
    ttl: Duration,
    dedup_window: Duration,
    claim_ttl: Duration,
}

impl PgIdempotencyStore {
    pub fn new(
        pool: PgPool,
        ttl: Duration,
        dedup_window: Duration,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            ttl,
            dedup_window,
            claim_ttl,
        }
    }

    fn classify_existing(row: &PgRow, fingerprint: &str) -> AppResult<Begin> {
        let stored_fingerprint: String = row.try_get("fingerprint")?;
        if stored_fingerprint != fingerprint {
            return Ok(Begin::Conflict);
        }
        let result: Option<serde_json::Value> = row.try_get("result")?;
        Ok(Begin::Duplicate(result))
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(&self, key: &str, fingerprint: &str) -> AppResult<Begin> {
        let now = Utc::now();
        let claim_ttl_secs = self.claim_ttl.as_secs() as f64;

        // clear this key's slot of rows that no longer bind: expired keys,
        // and result-less claims whose worker has been silent past the claim
        // TTL (a crashed run must not block the key for the full result TTL)
        sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE key = $1
              AND (expires_at <= $2
                   OR (result IS NULL AND created_at <= $2 - make_interval(secs => $3)))
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(claim_ttl_secs)
        .execute(&self.pool)
        .await?;

        if let Some(row) = sqlx::query(
            "SELECT fingerprint, result FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        {
            return Self::classify_existing(&row, fingerprint);
        }

        // content-based window across keys
        let window_secs = self.dedup_window.as_secs() as f64;
        if let Some(row) = sqlx::query(
            r#"
            SELECT fingerprint, result FROM idempotency_keys
            WHERE fingerprint = $1 AND key <> $2
              AND created_at > $3 - make_interval(secs => $4)
              AND NOT (result IS NULL AND created_at <= $3 - make_interval(secs => $5))
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .bind(key)
        .bind(now)
        .bind(window_secs)
        .bind(claim_ttl_secs)
        .fetch_optional(&self.pool)
        .await?
        {
            let result: Option<serde_json::Value> = row.try_get("result")?;
            return Ok(Begin::Duplicate(result));
        }

        // the window guard is re-checked inside the insert itself, so a twin
        // committed between the select above and here still blocks us; two
        // uncommitted racers can in principle both pass under read committed,
        // while the key-slot conflict stays the hard guarantee
        let expires_at = now + chrono::Duration::seconds(self.ttl.as_secs() as i64);
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, fingerprint, created_at, expires_at)
            SELECT $1, $2, $3, $4
            WHERE NOT EXISTS (
                SELECT 1 FROM idempotency_keys
                WHERE fingerprint = $2 AND key <> $1
                  AND created_at > $3 - make_interval(secs => $5)
            )
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(fingerprint)
        .bind(now)
        .bind(expires_at)
        .bind(window_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Begin::Fresh);
        }

        // lost a race: either the key slot was taken or a window twin
        // appeared; whichever row exists decides the outcome
        if let Some(row) =
            sqlx::query("SELECT fingerprint, result FROM idempotency_keys WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?
        {
            return Self::classify_existing(&row, fingerprint);
        }

        let row = sqlx::query(
            r#"
            SELECT fingerprint, result FROM idempotency_keys
            WHERE fingerprint = $1 AND key <> $2
              AND created_at > $3 - make_interval(secs => $4)
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .bind(key)
        .bind(now)
        .bind(window_secs)
        .fetch_one(&self.pool)
        .await?;
        let result: Option<serde_json::Value> = row.try_get("result")?;
        Ok(Begin::Duplicate(result))
    }

    async fn complete(&self, key: &str, result: serde_json::Value) -> AppResult<()> {
        sqlx::query(
            "UPDATE idempotency_keys SET result = $2 WHERE key = $1 AND result IS NULL",
        )
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND result IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
