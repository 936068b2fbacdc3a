pub mod bootstrap;
pub mod breaker;
pub mod config;
pub mod error;
pub mod escrow;
pub mod idempotency;
pub mod ledger;
pub mod lock;
pub mod reconciliation;
pub mod retry;
pub mod settlement;
