pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::MemoryLedgerStore;
pub use models::{
    replay_balances, validate_batch, AccountId, AccountType, Direction, EntryDraft, EntryStatus,
    LedgerEntry, ReferenceKind,
};
pub use postgres::PgLedgerStore;
pub use store::LedgerStore;
