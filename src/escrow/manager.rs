use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{EntryMethod, EscrowDeposit, EscrowReservation, ReservationStatus};
use super::store::EscrowStore;
use crate::config::Config;
use crate::error::{AppResult, EscrowError};
use crate::ledger::{AccountId, EntryDraft, LedgerStore, ReferenceKind};
use crate::lock::{business_key, Acquire, LockManager};

/// Outcome of a reservation attempt. `InsufficientFunds` is a business
/// outcome, never retried.
#[derive(Debug, Clone)]
pub enum Reserve {
    Reserved(EscrowReservation),
    InsufficientFunds { requested: i64, available: i64 },
}

/// Escrow deposit confirmation and reservation lifecycle. Reservation is the
/// critical section: the available balance is a derived aggregate, so the
/// check-and-reserve runs under the per-business lock with the balance
/// re-read inside it — never read-then-lock-then-write.
pub struct EscrowManager {
    ledger: Arc<dyn LedgerStore>,
    store: Arc<dyn EscrowStore>,
    locks: Arc<dyn LockManager>,
    config: Config,
}

impl EscrowManager {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        store: Arc<dyn EscrowStore>,
        locks: Arc<dyn LockManager>,
        config: Config,
    ) -> Self {
        Self {
            ledger,
            store,
            locks,
            config,
        }
    }

    /// Record a deposit intent. The fee and authorized amount are computed
    /// once, from the rate in effect now.
    pub async fn record_deposit(
        &self,
        business_id: Uuid,
        amount_minor: i64,
        entry_method: EntryMethod,
        bank_reference: Option<String>,
    ) -> AppResult<EscrowDeposit> {
        let deposit = EscrowDeposit::pending(
            business_id,
            amount_minor,
            self.config.deposit_fee_rate,
            &self.config.currency,
            entry_method,
            bank_reference,
        );
        self.store.insert_deposit(&deposit).await?;
        info!(
            deposit_id = %deposit.id,
            business_id = %business_id,
            amount_minor,
            fee_minor = deposit.fee_minor,
            "deposit recorded, awaiting bank confirmation"
        );
        Ok(deposit)
    }

    /// Operator-only confirmation: transitions pending -> confirmed and posts
    /// the escrow and fee credits against the clearing account.
    pub async fn confirm_deposit(&self, deposit_id: Uuid) -> AppResult<EscrowDeposit> {
        let deposit = self.store.confirm_deposit(deposit_id).await?;

        let business = deposit.business_id;
        let entries = vec![
            EntryDraft::debit(
                AccountId::payout(business),
                deposit.amount_minor,
                &deposit.currency,
                ReferenceKind::Deposit,
                deposit.id,
            ),
            EntryDraft::credit(
                AccountId::escrow(business),
                deposit.authorized_minor,
                &deposit.currency,
                ReferenceKind::Deposit,
                deposit.id,
            ),
            EntryDraft::credit(
                AccountId::fees(business),
                deposit.fee_minor,
                &deposit.currency,
                ReferenceKind::Deposit,
                deposit.id,
            ),
        ];
        // fee credit is zero when the rate is zero; drop it rather than
        // writing a zero-amount entry
        let entries = entries
            .into_iter()
            .filter(|e| e.amount_minor > 0)
            .collect::<Vec<_>>();
        self.ledger.append(entries).await?;

        info!(
            deposit_id = %deposit.id,
            business_id = %business,
            authorized_minor = deposit.authorized_minor,
            "deposit confirmed and posted"
        );
        Ok(deposit)
    }

    pub async fn fail_deposit(&self, deposit_id: Uuid) -> AppResult<EscrowDeposit> {
        self.store.fail_deposit(deposit_id).await
    }

    /// Confirmed escrow balance minus currently-held reservations.
    pub async fn available_balance(&self, business_id: Uuid) -> AppResult<i64> {
        let posted = self.ledger.balance(&AccountId::escrow(business_id)).await?;
        let held = self.store.held_total(business_id).await?;
        Ok(posted - held)
    }

    /// Check-and-reserve under the per-business lock. Linearizes all escrow
    /// mutations for one business; businesses never contend with each other.
    pub async fn reserve(
        &self,
        business_id: Uuid,
        amount_minor: i64,
        job_reference: Uuid,
    ) -> AppResult<Reserve> {
        let acquired = self
            .locks
            .acquire_wait(
                &business_key(business_id),
                self.config.business_lock_ttl,
                self.config.lock_wait_timeout,
            )
            .await?;
        let lease = match acquired {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy => return Err(EscrowError::BusinessLockBusy(business_id).into()),
        };

        let result = self
            .reserve_locked(business_id, amount_minor, job_reference)
            .await;
        self.locks.release(lease).await?;
        result
    }

    async fn reserve_locked(
        &self,
        business_id: Uuid,
        amount_minor: i64,
        job_reference: Uuid,
    ) -> AppResult<Reserve> {
        // re-read inside the lock; a stale available-balance read is the
        // principal double-spend bug class
        let available = self.available_balance(business_id).await?;
        if amount_minor > available {
            warn!(
                business_id = %business_id,
                job_reference = %job_reference,
                requested = amount_minor,
                available,
                "reservation rejected, insufficient escrow funds"
            );
            return Ok(Reserve::InsufficientFunds {
                requested: amount_minor,
                available,
            });
        }

        let now = Utc::now();
        let reservation = EscrowReservation {
            id: Uuid::new_v4(),
            business_id,
            job_reference,
            amount_minor,
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now
                + chrono::Duration::milliseconds(self.config.reservation_ttl.as_millis() as i64),
        };
        self.store.insert_reservation(&reservation).await?;
        Ok(Reserve::Reserved(reservation))
    }

    /// Settlement succeeded: spend the held funds. Posts the escrow debit and
    /// payout credit atomically with the status transition.
    pub async fn capture(&self, reservation_id: Uuid) -> AppResult<EscrowReservation> {
        let reservation = self
            .store
            .reservation(reservation_id)
            .await?
            .ok_or(EscrowError::ReservationNotFound(reservation_id))?;

        let entries = vec![
            EntryDraft::debit(
                AccountId::escrow(reservation.business_id),
                reservation.amount_minor,
                &self.config.currency,
                ReferenceKind::Job,
                reservation.job_reference,
            ),
            EntryDraft::credit(
                AccountId::payout(reservation.business_id),
                reservation.amount_minor,
                &self.config.currency,
                ReferenceKind::Job,
                reservation.job_reference,
            ),
        ];
        self.store.capture(reservation_id, entries).await
    }

    /// Settlement failed or was abandoned: return the funds to availability.
    pub async fn release(&self, reservation_id: Uuid) -> AppResult<EscrowReservation> {
        self.store.release(reservation_id).await
    }

    /// Orphan recovery: release held reservations past expiry. Run
    /// periodically from the scheduler.
    pub async fn sweep_stale_reservations(&self) -> AppResult<u64> {
        let released = self.store.release_stale(Utc::now()).await?;
        for reservation in &released {
            warn!(
                reservation_id = %reservation.id,
                business_id = %reservation.business_id,
                job_reference = %reservation.job_reference,
                amount_minor = reservation.amount_minor,
                "released stale reservation"
            );
        }
        Ok(released.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::memory::MemoryEscrowStore;
    use crate::ledger::MemoryLedgerStore;
    use crate::lock::MemoryLockManager;
    use std::time::Duration;

    fn manager() -> (EscrowManager, Arc<MemoryLedgerStore>) {
        let ledger = Arc::new(MemoryLedgerStore::immediate());
        let store = Arc::new(MemoryEscrowStore::new(ledger.clone()));
        let locks = Arc::new(MemoryLockManager::new());
        let manager = EscrowManager::new(ledger.clone(), store, locks, Config::default());
        (manager, ledger)
    }

    async fn funded_business(manager: &EscrowManager) -> Uuid {
        let business = Uuid::new_v4();
        let deposit = manager
            .record_deposit(business, 1_000_000, EntryMethod::Manual, None)
            .await
            .unwrap();
        manager.confirm_deposit(deposit.id).await.unwrap();
        business
    }

    #[tokio::test]
    async fn deposit_confirmation_scenario() {
        let (manager, _) = manager();
        let business = funded_business(&manager).await;

        // R10,000 at 1.5% leaves R9,850.00 available
        assert_eq!(manager.available_balance(business).await.unwrap(), 985_000);

        let first = manager
            .reserve(business, 985_000, Uuid::new_v4())
            .await
            .unwrap();
        let first = match first {
            Reserve::Reserved(r) => r,
            Reserve::InsufficientFunds { .. } => panic!("full balance must be reservable"),
        };

        // one more cent does not fit
        match manager.reserve(business, 1, Uuid::new_v4()).await.unwrap() {
            Reserve::InsufficientFunds { available, .. } => assert_eq!(available, 0),
            Reserve::Reserved(_) => panic!("over-subscription must be rejected"),
        }

        // releasing the first reservation frees the funds again
        manager.release(first.id).await.unwrap();
        assert!(matches!(
            manager.reserve(business, 1, Uuid::new_v4()).await.unwrap(),
            Reserve::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn confirming_twice_is_rejected() {
        let (manager, _) = manager();
        let business = Uuid::new_v4();
        let deposit = manager
            .record_deposit(business, 1_000_000, EntryMethod::App, None)
            .await
            .unwrap();
        manager.confirm_deposit(deposit.id).await.unwrap();
        assert!(manager.confirm_deposit(deposit.id).await.is_err());
        // and the ledger was only credited once
        assert_eq!(manager.available_balance(business).await.unwrap(), 985_000);
    }

    #[tokio::test]
    async fn capture_moves_funds_from_escrow_to_payout() {
        let (manager, ledger) = manager();
        let business = funded_business(&manager).await;
        let job = Uuid::new_v4();

        let reservation = match manager.reserve(business, 300_000, job).await.unwrap() {
            Reserve::Reserved(r) => r,
            _ => panic!(),
        };
        manager.capture(reservation.id).await.unwrap();

        assert_eq!(
            ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            685_000
        );
        // capture resolved the hold, so everything left is available
        assert_eq!(manager.available_balance(business).await.unwrap(), 685_000);

        // captured reservations cannot be captured or released again
        assert!(manager.capture(reservation.id).await.is_err());
        assert!(manager.release(reservation.id).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_reserves_never_oversubscribe() {
        let (manager, _) = manager();
        let business = funded_business(&manager).await;
        let manager = Arc::new(manager);

        // ten workers racing for 200,000 each against 985,000 available:
        // exactly four can fit
        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.reserve(business, 200_000, Uuid::new_v4()).await
            }));
        }

        let mut reserved = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Reserve::Reserved(_) => reserved += 1,
                Reserve::InsufficientFunds { .. } => rejected += 1,
            }
        }
        assert_eq!(reserved, 4);
        assert_eq!(rejected, 6);
        assert_eq!(manager.available_balance(business).await.unwrap(), 185_000);
    }

    #[tokio::test]
    async fn stale_reservations_are_swept_and_funds_freed() {
        let ledger = Arc::new(MemoryLedgerStore::immediate());
        let store = Arc::new(MemoryEscrowStore::new(ledger.clone()));
        let locks = Arc::new(MemoryLockManager::new());
        let config = Config {
            reservation_ttl: Duration::ZERO,
            schedule_lock_ttl: Duration::ZERO,
            ..Config::default()
        };
        let manager = EscrowManager::new(ledger, store, locks, config);
        let business = funded_business(&manager).await;

        match manager
            .reserve(business, 985_000, Uuid::new_v4())
            .await
            .unwrap()
        {
            Reserve::Reserved(_) => {}
            _ => panic!(),
        }
        assert_eq!(manager.available_balance(business).await.unwrap(), 0);

        // crashed worker never captured; the sweep reclaims the hold
        assert_eq!(manager.sweep_stale_reservations().await.unwrap(), 1);
        assert_eq!(manager.available_balance(business).await.unwrap(), 985_000);
        assert!(matches!(
            manager
                .reserve(business, 985_000, Uuid::new_v4())
                .await
                .unwrap(),
            Reserve::Reserved(_)
        ));
    }
}
