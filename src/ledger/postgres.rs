use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::models::{validate_batch, AccountId, AccountType, EntryDraft, EntryStatus, LedgerEntry};
use super::store::LedgerStore;
use crate::error::AppResult;

/// Postgres-backed ledger. A batch is written inside one transaction, so a
/// partial batch can never be observed or persisted.
pub struct PgLedgerStore {
    pool: PgPool,
    posting_delay: Duration,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, posting_delay: Duration) -> Self {
        Self { pool, posting_delay }
    }
}

/// Insert a validated batch inside an existing transaction. Shared with the
/// job store, whose success finalization must write ledger entries and the
/// job status transition atomically.
pub(crate) async fn insert_entries_tx(
    tx: &mut Transaction<'_, Postgres>,
    drafts: &[EntryDraft],
    posting_delay: Duration,
    now: DateTime<Utc>,
) -> AppResult<Vec<Uuid>> {
    validate_batch(drafts)?;

    let posted = posting_delay.is_zero();
    let status = if posted {
        EntryStatus::Posted
    } else {
        EntryStatus::Pending
    };
    let posted_at = posted.then_some(now);

    let mut ids = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, business_id, account_type, direction, amount_minor, currency,
                 reference_kind, reference_id, status, created_at, posted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(draft.account.business_id)
        .bind(draft.account.account_type)
        .bind(draft.direction)
        .bind(draft.amount_minor)
        .bind(&draft.currency)
        .bind(draft.reference_kind)
        .bind(draft.reference_id)
        .bind(status)
        .bind(now)
        .bind(posted_at)
        .execute(&mut **tx)
        .await?;
        ids.push(id);
    }

    Ok(ids)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn append(&self, drafts: Vec<EntryDraft>) -> AppResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let ids = insert_entries_tx(&mut tx, &drafts, self.posting_delay, Utc::now()).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn balance(&self, account: &AccountId) -> AppResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(
                CASE direction WHEN 'credit' THEN amount_minor ELSE -amount_minor END
            ), 0)::BIGINT
            FROM ledger_entries
            WHERE business_id = $1 AND account_type = $2 AND status = 'posted'
            "#,
        )
        .bind(account.business_id)
        .bind(account.account_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance.unwrap_or(0))
    }

    async fn post_due(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let delay = i64::try_from(self.posting_delay.as_secs()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET status = 'posted', posted_at = $1
            WHERE status = 'pending' AND created_at + make_interval(secs => $2) <= $1
            "#,
        )
        .bind(now)
        .bind(delay as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn entries_for_business(&self, business_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT id, business_id, account_type, direction, amount_minor, currency,
                   reference_kind, reference_id, status, created_at, posted_at
            FROM ledger_entries
            WHERE business_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn business_ids(&self) -> AppResult<Vec<Uuid>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT DISTINCT business_id FROM ledger_entries")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

impl PgLedgerStore {
    /// Balance of an account type over posted entries, usable inside a caller
    /// transaction (reconciliation reads under the business lock).
    pub async fn balance_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        business_id: Uuid,
        account_type: AccountType,
    ) -> AppResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(
                CASE direction WHEN 'credit' THEN amount_minor ELSE -amount_minor END
            ), 0)::BIGINT
            FROM ledger_entries
            WHERE business_id = $1 AND account_type = $2 AND status = 'posted'
            "#,
        )
        .bind(business_id)
        .bind(account_type)
        .fetch_one(&mut **tx)
        .await?;

        Ok(balance.unwrap_or(0))
    }
}
