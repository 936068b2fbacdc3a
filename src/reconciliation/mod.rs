pub mod memory;
pub mod postgres;

pub use memory::MemoryBalanceCache;
pub use postgres::PgBalanceCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::{AccountId, AccountType, Direction, EntryDraft, LedgerStore, ReferenceKind};

/// Materialized balance snapshot read by dashboards and reports. The ledger
/// stays authoritative; a snapshot is only ever a cache of it.
#[derive(Debug, Clone)]
pub struct CachedBalance {
    pub business_id: Uuid,
    pub account_type: AccountType,
    pub balance_minor: i64,
    pub computed_at: DateTime<Utc>,
    pub needs_review: bool,
}

#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn load(
        &self,
        business_id: Uuid,
        account_type: AccountType,
    ) -> AppResult<Option<CachedBalance>>;

    /// Upsert on (business_id, account_type).
    async fn save(&self, snapshot: &CachedBalance) -> AppResult<()>;
}

/// One reconciliation pass over every business in the ledger.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub businesses: u64,
    pub in_sync: u64,
    pub auto_fixed: u64,
    pub flagged: u64,
    pub failed: u64,
}

/// Detects drift between cached balances and the ledger. Drift within the
/// auto-fix ceiling is closed with a balanced adjustment entry; anything
/// larger is flagged for a human — a visible discrepancy beats a silent
/// large correction that might itself be wrong.
pub struct ReconciliationJob {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    auto_fix_max_minor: i64,
    currency: String,
}

impl ReconciliationJob {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
        auto_fix_max_minor: i64,
        currency: &str,
    ) -> Self {
        Self {
            ledger,
            cache,
            auto_fix_max_minor,
            currency: currency.to_string(),
        }
    }

    pub async fn run(&self) -> AppResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        for business_id in self.ledger.business_ids().await? {
            report.businesses += 1;
            // one broken business must not starve the rest of the pass
            if let Err(err) = self.reconcile_business(business_id, &mut report).await {
                error!(business_id = %business_id, error = %err, "reconciliation failed for business");
                report.failed += 1;
            }
        }
        info!(
            businesses = report.businesses,
            in_sync = report.in_sync,
            auto_fixed = report.auto_fixed,
            flagged = report.flagged,
            failed = report.failed,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    async fn reconcile_business(
        &self,
        business_id: Uuid,
        report: &mut ReconciliationReport,
    ) -> AppResult<()> {
        // escrow is the account external flows drift against; fees and payout
        // snapshots are simply refreshed from the ledger
        self.reconcile_escrow(business_id, report).await?;
        for account_type in [AccountType::Fees, AccountType::Payout] {
            let derived = self
                .ledger
                .balance(&AccountId {
                    business_id,
                    account_type,
                })
                .await?;
            self.cache
                .save(&CachedBalance {
                    business_id,
                    account_type,
                    balance_minor: derived,
                    computed_at: Utc::now(),
                    needs_review: false,
                })
                .await?;
        }
        Ok(())
    }

    async fn reconcile_escrow(
        &self,
        business_id: Uuid,
        report: &mut ReconciliationReport,
    ) -> AppResult<()> {
        let account = AccountId::escrow(business_id);
        let derived = self.ledger.balance(&account).await?;

        let cached = match self.cache.load(business_id, AccountType::Escrow).await? {
            Some(cached) => cached,
            None => {
                // first sight of this business: seed the snapshot
                self.cache
                    .save(&CachedBalance {
                        business_id,
                        account_type: AccountType::Escrow,
                        balance_minor: derived,
                        computed_at: Utc::now(),
                        needs_review: false,
                    })
                    .await?;
                report.in_sync += 1;
                return Ok(());
            }
        };

        let drift = cached.balance_minor - derived;
        if drift == 0 {
            self.cache
                .save(&CachedBalance {
                    computed_at: Utc::now(),
                    needs_review: false,
                    ..cached
                })
                .await?;
            report.in_sync += 1;
            return Ok(());
        }

        if drift.abs() > self.auto_fix_max_minor {
            error!(
                business_id = %business_id,
                cached = cached.balance_minor,
                derived,
                drift,
                ceiling = self.auto_fix_max_minor,
                "escrow drift exceeds auto-fix ceiling, flagging for manual review"
            );
            self.cache
                .save(&CachedBalance {
                    needs_review: true,
                    computed_at: Utc::now(),
                    ..cached
                })
                .await?;
            report.flagged += 1;
            return Ok(());
        }

        // close the gap with a balanced adjustment against the fee account
        let (escrow_direction, fees_direction) = if drift > 0 {
            (Direction::Credit, Direction::Debit)
        } else {
            (Direction::Debit, Direction::Credit)
        };
        let reference_id = Uuid::new_v4();
        let amount = drift.abs();
        self.ledger
            .append(vec![
                EntryDraft {
                    account,
                    direction: escrow_direction,
                    amount_minor: amount,
                    currency: self.currency.clone(),
                    reference_kind: ReferenceKind::Reconciliation,
                    reference_id,
                },
                EntryDraft {
                    account: AccountId::fees(business_id),
                    direction: fees_direction,
                    amount_minor: amount,
                    currency: self.currency.clone(),
                    reference_kind: ReferenceKind::Reconciliation,
                    reference_id,
                },
            ])
            .await?;
        warn!(
            business_id = %business_id,
            drift,
            reference_id = %reference_id,
            "escrow drift within ceiling, posted adjustment entry"
        );

        self.cache
            .save(&CachedBalance {
                computed_at: Utc::now(),
                needs_review: false,
                ..cached
            })
            .await?;
        report.auto_fixed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::ledger::{replay_balances, MemoryLedgerStore};

    fn job(
        auto_fix_max: i64,
    ) -> (
        ReconciliationJob,
        Arc<MemoryLedgerStore>,
        Arc<MemoryBalanceCache>,
    ) {
        let ledger = Arc::new(MemoryLedgerStore::immediate());
        let cache = Arc::new(MemoryBalanceCache::new());
        let job = ReconciliationJob::new(ledger.clone(), cache.clone(), auto_fix_max, "ZAR");
        (job, ledger, cache)
    }

    async fn seed_business(ledger: &MemoryLedgerStore, escrow_minor: i64) -> Uuid {
        let business = Uuid::new_v4();
        let reference = Uuid::new_v4();
        ledger
            .append(vec![
                EntryDraft::debit(
                    AccountId::payout(business),
                    escrow_minor,
                    "ZAR",
                    ReferenceKind::Deposit,
                    reference,
                ),
                EntryDraft::credit(
                    AccountId::escrow(business),
                    escrow_minor,
                    "ZAR",
                    ReferenceKind::Deposit,
                    reference,
                ),
            ])
            .await
            .unwrap();
        business
    }

    #[tokio::test]
    async fn first_run_seeds_snapshots_and_reports_in_sync() {
        let (job, ledger, cache) = job(100);
        let business = seed_business(&ledger, 500_000).await;

        let report = job.run().await.unwrap();
        assert_eq!(report.businesses, 1);
        assert_eq!(report.in_sync, 1);

        let snapshot = cache
            .load(business, AccountType::Escrow)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.balance_minor, 500_000);
        assert!(!snapshot.needs_review);

        // second run finds nothing to do
        let report = job.run().await.unwrap();
        assert_eq!(report.in_sync, 1);
        assert_eq!(report.auto_fixed, 0);
    }

    #[tokio::test]
    async fn small_drift_is_closed_with_an_adjustment_entry() {
        let (job, ledger, cache) = job(100);
        let business = seed_business(&ledger, 500_000).await;

        // dashboard cache ran ahead by 37 cents
        cache
            .save(&CachedBalance {
                business_id: business,
                account_type: AccountType::Escrow,
                balance_minor: 500_037,
                computed_at: Utc::now(),
                needs_review: false,
            })
            .await
            .unwrap();

        let report = job.run().await.unwrap();
        assert_eq!(report.auto_fixed, 1);
        assert_eq!(report.flagged, 0);

        // the ledger was adjusted up to the cached figure
        assert_eq!(
            ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            500_037
        );
        let snapshot = cache
            .load(business, AccountType::Escrow)
            .await
            .unwrap()
            .unwrap();
        assert!(!snapshot.needs_review);

        // the adjustment kept the ledger balanced: replay agrees per account
        let entries = ledger.entries_for_business(business).await.unwrap();
        let replayed = replay_balances(&entries);
        assert_eq!(replayed[&AccountType::Escrow], 500_037);
    }

    #[tokio::test]
    async fn large_drift_is_flagged_and_never_auto_corrected() {
        let (job, ledger, cache) = job(100);
        let business = seed_business(&ledger, 500_000).await;

        cache
            .save(&CachedBalance {
                business_id: business,
                account_type: AccountType::Escrow,
                balance_minor: 510_000,
                computed_at: Utc::now(),
                needs_review: false,
            })
            .await
            .unwrap();

        let report = job.run().await.unwrap();
        assert_eq!(report.auto_fixed, 0);
        assert_eq!(report.flagged, 1);

        // ledger untouched, snapshot flagged
        assert_eq!(
            ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            500_000
        );
        let snapshot = cache
            .load(business, AccountType::Escrow)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.needs_review);
        assert_eq!(snapshot.balance_minor, 510_000);
    }

    /// Cache whose rows for one business are unreadable.
    struct BrokenRowCache {
        inner: MemoryBalanceCache,
        broken: Uuid,
    }

    #[async_trait]
    impl BalanceCache for BrokenRowCache {
        async fn load(
            &self,
            business_id: Uuid,
            account_type: AccountType,
        ) -> AppResult<Option<CachedBalance>> {
            if business_id == self.broken {
                return Err(AppError::Internal("snapshot row unreadable".to_string()));
            }
            self.inner.load(business_id, account_type).await
        }

        async fn save(&self, snapshot: &CachedBalance) -> AppResult<()> {
            if snapshot.business_id == self.broken {
                return Err(AppError::Internal("snapshot row unreadable".to_string()));
            }
            self.inner.save(snapshot).await
        }
    }

    #[tokio::test]
    async fn one_failing_business_does_not_stop_the_pass() {
        let ledger = Arc::new(MemoryLedgerStore::immediate());
        let broken = seed_business(&ledger, 500_000).await;
        let healthy = seed_business(&ledger, 250_000).await;

        let cache = Arc::new(BrokenRowCache {
            inner: MemoryBalanceCache::new(),
            broken,
        });
        let job = ReconciliationJob::new(ledger.clone(), cache.clone(), 100, "ZAR");

        let report = job.run().await.unwrap();
        assert_eq!(report.businesses, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.in_sync, 1);

        // the healthy business was still seeded
        let snapshot = cache
            .inner
            .load(healthy, AccountType::Escrow)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.balance_minor, 250_000);
    }

    #[tokio::test]
    async fn negative_drift_debits_escrow() {
        let (job, ledger, cache) = job(100);
        let business = seed_business(&ledger, 500_000).await;

        cache
            .save(&CachedBalance {
                business_id: business,
                account_type: AccountType::Escrow,
                balance_minor: 499_950,
                computed_at: Utc::now(),
                needs_review: false,
            })
            .await
            .unwrap();

        let report = job.run().await.unwrap();
        assert_eq!(report.auto_fixed, 1);
        assert_eq!(
            ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            499_950
        );
    }
}
