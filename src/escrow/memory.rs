use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::models::{DepositStatus, EscrowDeposit, EscrowReservation, ReservationStatus};
use super::store::EscrowStore;
use crate::error::{AppResult, EscrowError};
use crate::ledger::{validate_batch, EntryDraft, LedgerStore, MemoryLedgerStore};

/// In-memory escrow store for tests, appending capture entries to a shared
/// in-memory ledger.
pub struct MemoryEscrowStore {
    ledger: Arc<MemoryLedgerStore>,
    deposits: Mutex<HashMap<Uuid, EscrowDeposit>>,
    reservations: Mutex<HashMap<Uuid, EscrowReservation>>,
}

impl MemoryEscrowStore {
    pub fn new(ledger: Arc<MemoryLedgerStore>) -> Self {
        Self {
            ledger,
            deposits: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    fn transition_deposit(
        &self,
        id: Uuid,
        to: DepositStatus,
    ) -> AppResult<EscrowDeposit> {
        let mut deposits = self.deposits.lock();
        let deposit = deposits
            .get_mut(&id)
            .ok_or(EscrowError::DepositNotFound(id))?;
        if deposit.status != DepositStatus::Pending {
            return Err(EscrowError::DepositInvalidState {
                id,
                current: format!("{:?}", deposit.status),
                expected: "Pending".to_string(),
            }
            .into());
        }
        deposit.status = to;
        deposit.completed_at = Some(Utc::now());
        Ok(deposit.clone())
    }

    fn transition_reservation(
        &self,
        id: Uuid,
        to: ReservationStatus,
    ) -> AppResult<EscrowReservation> {
        let mut reservations = self.reservations.lock();
        let reservation = reservations
            .get_mut(&id)
            .ok_or(EscrowError::ReservationNotFound(id))?;
        if reservation.status != ReservationStatus::Held {
            return Err(EscrowError::ReservationInvalidState {
                id,
                current: format!("{:?}", reservation.status),
            }
            .into());
        }
        reservation.status = to;
        Ok(reservation.clone())
    }
}

#[async_trait]
impl EscrowStore for MemoryEscrowStore {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> AppResult<()> {
        self.deposits.lock().insert(deposit.id, deposit.clone());
        Ok(())
    }

    async fn deposit(&self, id: Uuid) -> AppResult<Option<EscrowDeposit>> {
        Ok(self.deposits.lock().get(&id).cloned())
    }

    async fn confirm_deposit(&self, id: Uuid) -> AppResult<EscrowDeposit> {
        self.transition_deposit(id, DepositStatus::Confirmed)
    }

    async fn fail_deposit(&self, id: Uuid) -> AppResult<EscrowDeposit> {
        self.transition_deposit(id, DepositStatus::Failed)
    }

    async fn insert_reservation(&self, reservation: &EscrowReservation) -> AppResult<()> {
        self.reservations
            .lock()
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn reservation(&self, id: Uuid) -> AppResult<Option<EscrowReservation>> {
        Ok(self.reservations.lock().get(&id).cloned())
    }

    async fn held_total(&self, business_id: Uuid) -> AppResult<i64> {
        Ok(self
            .reservations
            .lock()
            .values()
            .filter(|r| r.business_id == business_id && r.status == ReservationStatus::Held)
            .map(|r| r.amount_minor)
            .sum())
    }

    async fn capture(
        &self,
        reservation_id: Uuid,
        entries: Vec<EntryDraft>,
    ) -> AppResult<EscrowReservation> {
        // validate before transitioning so a bad batch cannot strand the
        // reservation in captured with no ledger effect
        validate_batch(&entries)?;
        let reservation = self.transition_reservation(reservation_id, ReservationStatus::Captured)?;
        self.ledger.append(entries).await?;
        Ok(reservation)
    }

    async fn release(&self, reservation_id: Uuid) -> AppResult<EscrowReservation> {
        self.transition_reservation(reservation_id, ReservationStatus::Released)
    }

    async fn release_stale(&self, now: DateTime<Utc>) -> AppResult<Vec<EscrowReservation>> {
        let mut reservations = self.reservations.lock();
        let mut released = Vec::new();
        for reservation in reservations.values_mut() {
            if reservation.status == ReservationStatus::Held && reservation.expires_at <= now {
                reservation.status = ReservationStatus::Released;
                released.push(reservation.clone());
            }
        }
        Ok(released)
    }
}
