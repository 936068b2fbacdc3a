use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppResult, LedgerError};

/// Side of a double-entry record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "entry_direction", rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

/// Entries count towards balances only once posted. The posting delay is
/// configurable; with the default of zero, entries are posted on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "entry_status", rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Posted,
}

/// Logical accounts per business. Balances are derived projections over the
/// ledger, never separately authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "account_type", rename_all = "lowercase")]
pub enum AccountType {
    Escrow,
    Fees,
    Payout,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountType::Escrow => "escrow",
            AccountType::Fees => "fees",
            AccountType::Payout => "payout",
        };
        write!(f, "{s}")
    }
}

/// An account is identified by (business, type); it has no row of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId {
    pub business_id: Uuid,
    pub account_type: AccountType,
}

impl AccountId {
    pub fn escrow(business_id: Uuid) -> Self {
        Self {
            business_id,
            account_type: AccountType::Escrow,
        }
    }

    pub fn fees(business_id: Uuid) -> Self {
        Self {
            business_id,
            account_type: AccountType::Fees,
        }
    }

    pub fn payout(business_id: Uuid) -> Self {
        Self {
            business_id,
            account_type: AccountType::Payout,
        }
    }
}

/// What an entry settles: a deposit confirmation, a job capture, or a
/// reconciliation adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reference_kind", rename_all = "lowercase")]
pub enum ReferenceKind {
    Deposit,
    Job,
    Reconciliation,
}

/// Immutable ledger record. Never updated or deleted; corrections are new
/// offsetting entries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub business_id: Uuid,
    pub account_type: AccountType,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub reference_kind: ReferenceKind,
    pub reference_id: Uuid,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn account(&self) -> AccountId {
        AccountId {
            business_id: self.business_id,
            account_type: self.account_type,
        }
    }

    /// Signed contribution to the account balance (credits positive).
    pub fn signed_amount(&self) -> i64 {
        match self.direction {
            Direction::Credit => self.amount_minor,
            Direction::Debit => -self.amount_minor,
        }
    }
}

/// Entry as submitted to the store; ids, status and timestamps are assigned
/// at append time.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub account: AccountId,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub reference_kind: ReferenceKind,
    pub reference_id: Uuid,
}

impl EntryDraft {
    pub fn debit(
        account: AccountId,
        amount_minor: i64,
        currency: &str,
        reference_kind: ReferenceKind,
        reference_id: Uuid,
    ) -> Self {
        Self {
            account,
            direction: Direction::Debit,
            amount_minor,
            currency: currency.to_string(),
            reference_kind,
            reference_id,
        }
    }

    pub fn credit(
        account: AccountId,
        amount_minor: i64,
        currency: &str,
        reference_kind: ReferenceKind,
        reference_id: Uuid,
    ) -> Self {
        Self {
            account,
            direction: Direction::Credit,
            amount_minor,
            currency: currency.to_string(),
            reference_kind,
            reference_id,
        }
    }
}

/// Reject a batch unless, per currency, total debits equal total credits and
/// every amount is positive. Storage implementations call this before any
/// write so a half-written batch can never exist.
pub fn validate_batch(entries: &[EntryDraft]) -> AppResult<()> {
    if entries.is_empty() {
        return Err(LedgerError::EmptyBatch.into());
    }

    let mut per_currency: HashMap<&str, (i64, i64)> = HashMap::new();
    for entry in entries {
        if entry.amount_minor <= 0 {
            return Err(LedgerError::NonPositiveAmount {
                amount: entry.amount_minor,
                reference: entry.reference_id,
            }
            .into());
        }
        let sums = per_currency.entry(entry.currency.as_str()).or_default();
        match entry.direction {
            Direction::Debit => sums.0 += entry.amount_minor,
            Direction::Credit => sums.1 += entry.amount_minor,
        }
    }

    for (currency, (debits, credits)) in per_currency {
        if debits != credits {
            return Err(LedgerError::Unbalanced {
                debits,
                credits,
                currency: currency.to_string(),
            }
            .into());
        }
    }

    Ok(())
}

/// Recompute all balances for a business purely from posted entries, in
/// created order. This is the correctness oracle used by reconciliation.
pub fn replay_balances(entries: &[LedgerEntry]) -> HashMap<AccountType, i64> {
    let mut balances = HashMap::new();
    for entry in entries {
        if entry.status == EntryStatus::Posted {
            *balances.entry(entry.account_type).or_insert(0) += entry.signed_amount();
        }
    }
    balances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(direction: Direction, amount: i64) -> EntryDraft {
        EntryDraft {
            account: AccountId::escrow(Uuid::new_v4()),
            direction,
            amount_minor: amount,
            currency: "ZAR".to_string(),
            reference_kind: ReferenceKind::Deposit,
            reference_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn balanced_batch_is_accepted() {
        let batch = vec![draft(Direction::Debit, 500), draft(Direction::Credit, 500)];
        assert!(validate_batch(&batch).is_ok());
    }

    #[test]
    fn unbalanced_batch_is_rejected() {
        let batch = vec![draft(Direction::Debit, 500), draft(Direction::Credit, 400)];
        assert!(validate_batch(&batch).is_err());
    }

    #[test]
    fn empty_and_non_positive_batches_are_rejected() {
        assert!(validate_batch(&[]).is_err());
        let batch = vec![draft(Direction::Debit, 0), draft(Direction::Credit, 0)];
        assert!(validate_batch(&batch).is_err());
    }

    #[test]
    fn balance_must_net_per_currency() {
        let mut usd = draft(Direction::Debit, 300);
        usd.currency = "USD".to_string();
        // ZAR credit cannot offset a USD debit
        let batch = vec![usd, draft(Direction::Credit, 300)];
        assert!(validate_batch(&batch).is_err());
    }
}
