use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::models::{EscrowDeposit, EscrowReservation};
use super::store::EscrowStore;
use crate::error::{AppResult, EscrowError};
use crate::ledger::postgres::insert_entries_tx;
use crate::ledger::EntryDraft;

/// Postgres escrow store. All status transitions are compare-and-set UPDATEs
/// guarded on the current status; capture runs the transition and the ledger
/// batch in one transaction.
pub struct PgEscrowStore {
    pool: PgPool,
    posting_delay: Duration,
}

impl PgEscrowStore {
    pub fn new(pool: PgPool, posting_delay: Duration) -> Self {
        Self { pool, posting_delay }
    }

    async fn deposit_status(&self, id: Uuid) -> AppResult<String> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status::TEXT FROM escrow_deposits WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        status.ok_or_else(|| EscrowError::DepositNotFound(id).into())
    }

    async fn transition_deposit(&self, id: Uuid, to: &str) -> AppResult<EscrowDeposit> {
        let deposit = sqlx::query_as::<_, EscrowDeposit>(
            r#"
            UPDATE escrow_deposits
            SET status = $2::deposit_status, completed_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING id, business_id, amount_minor, fee_minor, authorized_minor, currency,
                      status, entry_method, bank_reference, deposited_at, completed_at
            "#,
        )
        .bind(id)
        .bind(to)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match deposit {
            Some(deposit) => Ok(deposit),
            None => Err(EscrowError::DepositInvalidState {
                id,
                current: self.deposit_status(id).await?,
                expected: "pending".to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl EscrowStore for PgEscrowStore {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_deposits
                (id, business_id, amount_minor, fee_minor, authorized_minor, currency,
                 status, entry_method, bank_reference, deposited_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(deposit.id)
        .bind(deposit.business_id)
        .bind(deposit.amount_minor)
        .bind(deposit.fee_minor)
        .bind(deposit.authorized_minor)
        .bind(&deposit.currency)
        .bind(deposit.status)
        .bind(deposit.entry_method)
        .bind(&deposit.bank_reference)
        .bind(deposit.deposited_at)
        .bind(deposit.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deposit(&self, id: Uuid) -> AppResult<Option<EscrowDeposit>> {
        let deposit = sqlx::query_as::<_, EscrowDeposit>(
            r#"
            SELECT id, business_id, amount_minor, fee_minor, authorized_minor, currency,
                   status, entry_method, bank_reference, deposited_at, completed_at
            FROM escrow_deposits
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deposit)
    }

    async fn confirm_deposit(&self, id: Uuid) -> AppResult<EscrowDeposit> {
        self.transition_deposit(id, "confirmed").await
    }

    async fn fail_deposit(&self, id: Uuid) -> AppResult<EscrowDeposit> {
        self.transition_deposit(id, "failed").await
    }

    async fn insert_reservation(&self, reservation: &EscrowReservation) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_reservations
                (id, business_id, job_reference, amount_minor, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.business_id)
        .bind(reservation.job_reference)
        .bind(reservation.amount_minor)
        .bind(reservation.status)
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reservation(&self, id: Uuid) -> AppResult<Option<EscrowReservation>> {
        let reservation = sqlx::query_as::<_, EscrowReservation>(
            r#"
            SELECT id, business_id, job_reference, amount_minor, status, created_at, expires_at
            FROM escrow_reservations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reservation)
    }

    async fn held_total(&self, business_id: Uuid) -> AppResult<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_minor), 0)::BIGINT
            FROM escrow_reservations
            WHERE business_id = $1 AND status = 'held'
            "#,
        )
        .bind(business_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0))
    }

    async fn capture(
        &self,
        reservation_id: Uuid,
        entries: Vec<EntryDraft>,
    ) -> AppResult<EscrowReservation> {
        let mut tx = self.pool.begin().await?;

        let reservation = sqlx::query_as::<_, EscrowReservation>(
            r#"
            UPDATE escrow_reservations
            SET status = 'captured'
            WHERE id = $1 AND status = 'held'
            RETURNING id, business_id, job_reference, amount_minor, status, created_at, expires_at
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(EscrowError::ReservationInvalidState {
            id: reservation_id,
            current: "not held".to_string(),
        })?;

        insert_entries_tx(&mut tx, &entries, self.posting_delay, Utc::now()).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    async fn release(&self, reservation_id: Uuid) -> AppResult<EscrowReservation> {
        let reservation = sqlx::query_as::<_, EscrowReservation>(
            r#"
            UPDATE escrow_reservations
            SET status = 'released'
            WHERE id = $1 AND status = 'held'
            RETURNING id, business_id, job_reference, amount_minor, status, created_at, expires_at
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EscrowError::ReservationInvalidState {
            id: reservation_id,
            current: "not held".to_string(),
        })?;
        Ok(reservation)
    }

    async fn release_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<EscrowReservation>> {
        let released = sqlx::query_as::<_, EscrowReservation>(
            r#"
            UPDATE escrow_reservations
            SET status = 'released'
            WHERE status = 'held' AND expires_at <= $1
            RETURNING id, business_id, job_reference, amount_minor, status, created_at, expires_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(released)
    }
}
