use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{AccountId, EntryDraft, LedgerEntry};
use crate::error::AppResult;

/// Source of truth for all money movement. Append-only: implementations must
/// write a batch atomically (all entries or none) and must never mutate an
/// entry after the fact, other than the pending -> posted promotion.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically append a balanced batch, returning the new entry ids.
    async fn append(&self, entries: Vec<EntryDraft>) -> AppResult<Vec<Uuid>>;

    /// Balance over posted entries only (credits minus debits).
    async fn balance(&self, account: &AccountId) -> AppResult<i64>;

    /// Promote pending entries whose posting delay has elapsed. Returns the
    /// number of entries posted.
    async fn post_due(&self, now: DateTime<Utc>) -> AppResult<u64>;

    /// All entries for a business in created order, for replay.
    async fn entries_for_business(&self, business_id: Uuid) -> AppResult<Vec<LedgerEntry>>;

    /// Distinct businesses present in the ledger, for reconciliation runs.
    async fn business_ids(&self) -> AppResult<Vec<Uuid>>;
}
