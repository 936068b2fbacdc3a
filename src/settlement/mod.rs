pub mod gateway;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod postgres;
pub mod scheduler;
pub mod store;

pub use gateway::{
    GatewayReceipt, MockGateway, SettlementGateway, SettlementRequest, GATEWAY_BREAKER_KEY,
};
pub use memory::MemoryJobStore;
pub use models::{JobKind, JobOutcome, JobStatus, NewJob, SettlementJob};
pub use orchestrator::SettlementOrchestrator;
pub use postgres::PgJobStore;
pub use scheduler::SettlementScheduler;
pub use store::JobStore;
