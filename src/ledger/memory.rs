use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::models::{validate_batch, AccountId, EntryDraft, EntryStatus, LedgerEntry};
use super::store::LedgerStore;
use crate::error::AppResult;

/// In-memory ledger used by the test suite. Appends happen under a single
/// mutex, which gives the same all-or-nothing guarantee the Postgres
/// implementation gets from a transaction.
pub struct MemoryLedgerStore {
    posting_delay: Duration,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new(posting_delay: Duration) -> Self {
        Self {
            posting_delay,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    fn materialize(&self, draft: EntryDraft, now: DateTime<Utc>) -> LedgerEntry {
        let posted = self.posting_delay.is_zero();
        LedgerEntry {
            id: Uuid::new_v4(),
            business_id: draft.account.business_id,
            account_type: draft.account.account_type,
            direction: draft.direction,
            amount_minor: draft.amount_minor,
            currency: draft.currency,
            reference_kind: draft.reference_kind,
            reference_id: draft.reference_id,
            status: if posted {
                EntryStatus::Posted
            } else {
                EntryStatus::Pending
            },
            created_at: now,
            posted_at: posted.then_some(now),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, drafts: Vec<EntryDraft>) -> AppResult<Vec<Uuid>> {
        validate_batch(&drafts)?;
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let entry = self.materialize(draft, now);
            ids.push(entry.id);
            entries.push(entry);
        }
        Ok(ids)
    }

    async fn balance(&self, account: &AccountId) -> AppResult<i64> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|e| e.status == EntryStatus::Posted && e.account() == *account)
            .map(|e| e.signed_amount())
            .sum())
    }

    async fn post_due(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let delay = ChronoDuration::from_std(self.posting_delay)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let mut entries = self.entries.lock();
        let mut posted = 0;
        for entry in entries.iter_mut() {
            if entry.status == EntryStatus::Pending && entry.created_at + delay <= now {
                entry.status = EntryStatus::Posted;
                entry.posted_at = Some(now);
                posted += 1;
            }
        }
        Ok(posted)
    }

    async fn entries_for_business(&self, business_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|e| e.business_id == business_id)
            .cloned()
            .collect())
    }

    async fn business_ids(&self) -> AppResult<Vec<Uuid>> {
        let entries = self.entries.lock();
        let mut ids: Vec<Uuid> = entries.iter().map(|e| e.business_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}
