use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{EscrowDeposit, EscrowReservation};
use crate::error::AppResult;
use crate::ledger::EntryDraft;

/// Persistence for deposits and reservations. Status transitions are guarded
/// (compare-and-set on the current status) so concurrent workers cannot both
/// move the same row; `capture` must write the reservation transition and its
/// ledger entries atomically.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> AppResult<()>;

    async fn deposit(&self, id: Uuid) -> AppResult<Option<EscrowDeposit>>;

    /// Guarded pending -> confirmed.
    async fn confirm_deposit(&self, id: Uuid) -> AppResult<EscrowDeposit>;

    /// Guarded pending -> failed.
    async fn fail_deposit(&self, id: Uuid) -> AppResult<EscrowDeposit>;

    async fn insert_reservation(&self, reservation: &EscrowReservation) -> AppResult<()>;

    async fn reservation(&self, id: Uuid) -> AppResult<Option<EscrowReservation>>;

    /// Sum of currently-held reservation amounts for a business.
    async fn held_total(&self, business_id: Uuid) -> AppResult<i64>;

    /// Guarded held -> captured, atomically appending the settlement ledger
    /// entries.
    async fn capture(
        &self,
        reservation_id: Uuid,
        entries: Vec<EntryDraft>,
    ) -> AppResult<EscrowReservation>;

    /// Guarded held -> released. No ledger effect; funds simply become
    /// available again.
    async fn release(&self, reservation_id: Uuid) -> AppResult<EscrowReservation>;

    /// Release every held reservation whose expiry has passed (orphans left
    /// by crashed workers). Returns the released reservations.
    async fn release_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<EscrowReservation>>;
}
