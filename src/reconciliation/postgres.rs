use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{BalanceCache, CachedBalance};
use crate::error::AppResult;
use crate::ledger::AccountType;

pub struct PgBalanceCache {
    pool: PgPool,
}

impl PgBalanceCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BalanceCache for PgBalanceCache {
    async fn load(
        &self,
        business_id: Uuid,
        account_type: AccountType,
    ) -> AppResult<Option<CachedBalance>> {
        let row = sqlx::query_as::<_, (i64, chrono::DateTime<chrono::Utc>, bool)>(
            r#"
            SELECT balance_minor, computed_at, needs_review
            FROM cached_balances
            WHERE business_id = $1 AND account_type = $2
            "#,
        )
        .bind(business_id)
        .bind(account_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(balance_minor, computed_at, needs_review)| CachedBalance {
            business_id,
            account_type,
            balance_minor,
            computed_at,
            needs_review,
        }))
    }

    async fn save(&self, snapshot: &CachedBalance) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cached_balances (business_id, account_type, balance_minor, computed_at, needs_review)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (business_id, account_type) DO UPDATE
            SET balance_minor = EXCLUDED.balance_minor,
                computed_at = EXCLUDED.computed_at,
                needs_review = EXCLUDED.needs_review
            "#,
        )
        .bind(snapshot.business_id)
        .bind(snapshot.account_type)
        .bind(snapshot.balance_minor)
        .bind(snapshot.computed_at)
        .bind(snapshot.needs_review)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
