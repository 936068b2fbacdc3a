use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{JobKind, NewJob, SettlementJob};
use crate::error::AppResult;
use crate::ledger::EntryDraft;

/// Persistence for settlement jobs. The two `finalize_*` methods own the
/// transaction boundary for terminal transitions: a job may never be
/// succeeded without its ledger entries existing, so the reservation
/// transition, the ledger batch and the status change commit together or not
/// at all.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent creation keyed on (kind, schedule, recipient, period).
    /// Returns None when the job already exists — overlapping scheduler
    /// ticks are a no-op.
    async fn enqueue(&self, job: NewJob) -> AppResult<Option<SettlementJob>>;

    async fn job(&self, id: Uuid) -> AppResult<Option<SettlementJob>>;

    /// Distinct schedules with due pending jobs, the unit the schedule lock
    /// protects.
    async fn due_schedules(&self, kind: JobKind, now: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    async fn due_jobs(
        &self,
        kind: JobKind,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementJob>>;

    /// Guarded pending -> processing.
    async fn mark_processing(&self, id: Uuid) -> AppResult<SettlementJob>;

    /// Deferral: guarded processing -> pending, clearing the processing mark.
    async fn requeue(&self, id: Uuid) -> AppResult<()>;

    /// Crash recovery: processing entered before `cutoff` with no terminal
    /// transition goes back to pending. Returns the number reclaimed.
    async fn requeue_stuck(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Atomic: reservation held -> captured, ledger batch appended, job
    /// processing -> succeeded with the rail reference recorded.
    async fn finalize_success(
        &self,
        job_id: Uuid,
        reservation_id: Uuid,
        gateway_reference: &str,
        entries: Vec<EntryDraft>,
    ) -> AppResult<SettlementJob>;

    /// Atomic: reservation (if any) held -> released, job -> failed with the
    /// human-readable reason persisted.
    async fn finalize_failure(
        &self,
        job_id: Uuid,
        reservation_id: Option<Uuid>,
        reason: &str,
    ) -> AppResult<SettlementJob>;
}
