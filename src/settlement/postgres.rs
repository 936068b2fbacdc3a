use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::models::{JobKind, NewJob, SettlementJob};
use super::store::JobStore;
use crate::error::{AppResult, EscrowError, SettlementError};
use crate::ledger::postgres::insert_entries_tx;
use crate::ledger::EntryDraft;

const JOB_COLUMNS: &str = "id, kind, business_id, schedule_id, recipient_id, period_key, \
     amount_minor, currency, calculation_version, status, failure_reason, gateway_reference, \
     due_at, processing_at, settled_at, created_at";

/// Postgres job store. Terminal transitions run in one transaction with
/// their reservation and ledger effects.
pub struct PgJobStore {
    pool: PgPool,
    posting_delay: Duration,
}

impl PgJobStore {
    pub fn new(pool: PgPool, posting_delay: Duration) -> Self {
        Self { pool, posting_delay }
    }

    async fn capture_reservation_tx(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: Uuid,
    ) -> AppResult<()> {
        let captured = sqlx::query(
            "UPDATE escrow_reservations SET status = 'captured' WHERE id = $1 AND status = 'held'",
        )
        .bind(reservation_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if captured != 1 {
            return Err(EscrowError::ReservationInvalidState {
                id: reservation_id,
                current: "not held".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> AppResult<Option<SettlementJob>> {
        let inserted = sqlx::query_as::<_, SettlementJob>(&format!(
            r#"
            INSERT INTO settlement_jobs
                (id, kind, business_id, schedule_id, recipient_id, period_key,
                 amount_minor, currency, calculation_version, status, due_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11)
            ON CONFLICT (kind, schedule_id, recipient_id, period_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(job.kind)
        .bind(job.business_id)
        .bind(job.schedule_id)
        .bind(job.recipient_id)
        .bind(&job.period_key)
        .bind(job.amount_minor)
        .bind(&job.currency)
        .bind(job.calculation_version)
        .bind(job.due_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn job(&self, id: Uuid) -> AppResult<Option<SettlementJob>> {
        let job = sqlx::query_as::<_, SettlementJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM settlement_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn due_schedules(&self, kind: JobKind, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let schedules: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT schedule_id FROM settlement_jobs
            WHERE kind = $1 AND status = 'pending' AND due_at <= $2
            "#,
        )
        .bind(kind)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn due_jobs(
        &self,
        kind: JobKind,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementJob>> {
        let jobs = sqlx::query_as::<_, SettlementJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM settlement_jobs
            WHERE kind = $1 AND schedule_id = $2 AND status = 'pending' AND due_at <= $3
            ORDER BY created_at, id
            "#
        ))
        .bind(kind)
        .bind(schedule_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn mark_processing(&self, id: Uuid) -> AppResult<SettlementJob> {
        let job = sqlx::query_as::<_, SettlementJob>(&format!(
            r#"
            UPDATE settlement_jobs
            SET status = 'processing', processing_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| {
            SettlementError::InvalidState {
                id,
                current: "not pending".to_string(),
                expected: "Pending".to_string(),
            }
            .into()
        })
    }

    async fn requeue(&self, id: Uuid) -> AppResult<()> {
        let requeued = sqlx::query(
            r#"
            UPDATE settlement_jobs
            SET status = 'pending', processing_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if requeued != 1 {
            return Err(SettlementError::InvalidState {
                id,
                current: "not processing".to_string(),
                expected: "Processing".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn requeue_stuck(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_jobs
            SET status = 'pending', processing_at = NULL
            WHERE status = 'processing' AND processing_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn finalize_success(
        &self,
        job_id: Uuid,
        reservation_id: Uuid,
        gateway_reference: &str,
        entries: Vec<EntryDraft>,
    ) -> AppResult<SettlementJob> {
        let mut tx = self.pool.begin().await?;

        Self::capture_reservation_tx(&mut tx, reservation_id).await?;
        insert_entries_tx(&mut tx, &entries, self.posting_delay, Utc::now()).await?;

        let job = sqlx::query_as::<_, SettlementJob>(&format!(
            r#"
            UPDATE settlement_jobs
            SET status = 'succeeded', gateway_reference = $3, settled_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(Utc::now())
        .bind(gateway_reference)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(SettlementError::InvalidState {
            id: job_id,
            current: "not processing".to_string(),
            expected: "Processing".to_string(),
        })?;

        tx.commit().await?;
        Ok(job)
    }

    async fn finalize_failure(
        &self,
        job_id: Uuid,
        reservation_id: Option<Uuid>,
        reason: &str,
    ) -> AppResult<SettlementJob> {
        let mut tx = self.pool.begin().await?;

        if let Some(reservation_id) = reservation_id {
            // best effort: the reservation may already have been swept
            sqlx::query(
                "UPDATE escrow_reservations SET status = 'released' WHERE id = $1 AND status = 'held'",
            )
            .bind(reservation_id)
            .execute(&mut *tx)
            .await?;
        }

        let job = sqlx::query_as::<_, SettlementJob>(&format!(
            r#"
            UPDATE settlement_jobs
            SET status = 'failed', failure_reason = $2, settled_at = $3
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(reason)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(SettlementError::InvalidState {
            id: job_id,
            current: "not processing".to_string(),
            expected: "Processing".to_string(),
        })?;

        tx.commit().await?;
        Ok(job)
    }
}
