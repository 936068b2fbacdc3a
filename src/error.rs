use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the entire worker
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Idempotency key {key} reused with a different fingerprint")]
    IdempotencyConflict { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Ledger-specific errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Unbalanced entry batch: debits {debits} != credits {credits} for {currency}")]
    Unbalanced {
        debits: i64,
        credits: i64,
        currency: String,
    },

    #[error("Empty entry batch")]
    EmptyBatch,

    #[error("Non-positive amount {amount} on entry referencing {reference}")]
    NonPositiveAmount { amount: i64, reference: Uuid },
}

/// Escrow deposit / reservation errors
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Deposit {0} not found")]
    DepositNotFound(Uuid),

    #[error("Deposit {id} in state {current}, expected {expected}")]
    DepositInvalidState {
        id: Uuid,
        current: String,
        expected: String,
    },

    #[error("Reservation {0} not found")]
    ReservationNotFound(Uuid),

    #[error("Reservation {id} in state {current}, expected held")]
    ReservationInvalidState { id: Uuid, current: String },

    #[error("Business lock busy for {0}")]
    BusinessLockBusy(Uuid),
}

/// Settlement job errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {id} in state {current}, expected {expected}")]
    InvalidState {
        id: Uuid,
        current: String,
        expected: String,
    },

    #[error("Job {0} is terminal and cannot be reprocessed")]
    Terminal(Uuid),
}

/// Settlement gateway errors. `Declined` is a business outcome and is never
/// retried; the others are transient infrastructure failures.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway timed out")]
    Timeout,
}

impl AppError {
    /// Failure taxonomy used by the retry executor: only transient
    /// infrastructure failures may be retried. Business failures
    /// (declines, insufficient funds, validation, idempotency conflicts)
    /// propagate immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => is_transient_sqlx(e),
            AppError::Gateway(GatewayError::Unavailable(_)) => true,
            AppError::Gateway(GatewayError::Timeout) => true,
            _ => false,
        }
    }
}

/// Deadlocks, serialization failures and lock-wait timeouts are retryable;
/// so is losing the connection mid-flight. Constraint violations are not.
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001") | Some("40P01") | Some("55P03")
        ),
        _ => false,
    }
}

/// Result type alias for the worker
pub type AppResult<T> = Result<T, AppError>;
