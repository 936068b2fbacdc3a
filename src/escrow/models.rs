use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

/// Deposits are confirmed only by an explicit operator action, reflecting
/// real-world bank settlement lag. The system never auto-confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "deposit_status", rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "entry_method", rename_all = "lowercase")]
pub enum EntryMethod {
    App,
    Manual,
}

/// A deposit intent and its confirmation lifecycle. `authorized_minor` is
/// fixed at creation from the fee rate in effect at that time; later rate
/// changes never retroactively alter a deposit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowDeposit {
    pub id: Uuid,
    pub business_id: Uuid,
    pub amount_minor: i64,
    pub fee_minor: i64,
    pub authorized_minor: i64,
    pub currency: String,
    pub status: DepositStatus,
    pub entry_method: EntryMethod,
    pub bank_reference: Option<String>,
    pub deposited_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EscrowDeposit {
    pub fn pending(
        business_id: Uuid,
        amount_minor: i64,
        fee_rate: Decimal,
        currency: &str,
        entry_method: EntryMethod,
        bank_reference: Option<String>,
    ) -> Self {
        let fee_minor = fee_for(amount_minor, fee_rate);
        Self {
            id: Uuid::new_v4(),
            business_id,
            amount_minor,
            fee_minor,
            authorized_minor: amount_minor - fee_minor,
            currency: currency.to_string(),
            status: DepositStatus::Pending,
            entry_method,
            bank_reference,
            deposited_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Fee in minor units, rounded half away from zero.
pub fn fee_for(amount_minor: i64, fee_rate: Decimal) -> i64 {
    (Decimal::from(amount_minor) * fee_rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// A held reservation resolves to captured (funds spent) or released (funds
/// returned). `expires_at` bounds how long a crashed worker can orphan funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reservation_status", rename_all = "lowercase")]
pub enum ReservationStatus {
    Held,
    Captured,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowReservation {
    pub id: Uuid,
    pub business_id: Uuid,
    pub job_reference: Uuid,
    pub amount_minor: i64,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
