pub mod manager;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use manager::{EscrowManager, Reserve};
pub use memory::MemoryEscrowStore;
pub use models::{
    fee_for, DepositStatus, EntryMethod, EscrowDeposit, EscrowReservation, ReservationStatus,
};
pub use postgres::PgEscrowStore;
pub use store::EscrowStore;
