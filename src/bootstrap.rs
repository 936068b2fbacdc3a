use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::breaker::{CircuitBreaker, PgBreakerStore};
use crate::config::Config;
use crate::error::AppResult;
use crate::escrow::{EscrowManager, PgEscrowStore};
use crate::idempotency::{IdempotencyStore, PgIdempotencyStore};
use crate::ledger::{LedgerStore, PgLedgerStore};
use crate::lock::{LockManager, PgLockManager};
use crate::reconciliation::{PgBalanceCache, ReconciliationJob};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::settlement::{
    JobStore, MockGateway, PgJobStore, SettlementGateway, SettlementOrchestrator,
    SettlementScheduler,
};

/// Fully wired worker. Every strategy object is constructed exactly once
/// here and shared by Arc; nothing else in the crate opens connections or
/// reads the environment.
pub struct AppContext {
    pub config: Config,
    pub pool: PgPool,
    pub ledger: Arc<dyn LedgerStore>,
    pub escrow: Arc<EscrowManager>,
    pub jobs: Arc<dyn JobStore>,
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub scheduler: Arc<SettlementScheduler>,
}

pub async fn initialize_worker(config: Config) -> AppResult<AppContext> {
    info!("initializing worker components");

    let pool = initialize_database(&config.database_url).await?;

    let ledger: Arc<dyn LedgerStore> =
        Arc::new(PgLedgerStore::new(pool.clone(), config.posting_delay));
    let locks: Arc<dyn LockManager> = Arc::new(PgLockManager::new(pool.clone()));
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(PgIdempotencyStore::new(
        pool.clone(),
        config.idempotency_ttl,
        config.dedup_window,
        // a crashed worker's claim unblocks on the same clock as its job row
        config.stuck_job_timeout,
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        Arc::new(PgBreakerStore::new(pool.clone())),
        config.breaker_failure_threshold,
        config.breaker_open_timeout,
        config.breaker_half_open_successes,
    ));

    let escrow_store = Arc::new(PgEscrowStore::new(pool.clone(), config.posting_delay));
    let escrow = Arc::new(EscrowManager::new(
        ledger.clone(),
        escrow_store,
        locks.clone(),
        config.clone(),
    ));

    let jobs: Arc<dyn JobStore> =
        Arc::new(PgJobStore::new(pool.clone(), config.posting_delay));
    let gateway: Arc<dyn SettlementGateway> = Arc::new(MockGateway::from_config(&config));
    info!(
        success_rate = config.gateway_success_rate,
        decline_rate = config.gateway_decline_rate,
        "mock settlement gateway registered"
    );

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        jobs.clone(),
        idempotency.clone(),
        escrow.clone(),
        breaker,
        gateway,
        RetryExecutor::new(RetryPolicy::from_config(&config)),
    ));

    let reconciliation = Arc::new(ReconciliationJob::new(
        ledger.clone(),
        Arc::new(PgBalanceCache::new(pool.clone())),
        config.reconciliation_auto_fix_max_minor,
        &config.currency,
    ));

    let scheduler = Arc::new(SettlementScheduler::new(
        config.clone(),
        orchestrator.clone(),
        jobs.clone(),
        locks,
        escrow.clone(),
        ledger.clone(),
        idempotency,
        reconciliation,
    ));

    info!("worker components initialized");
    Ok(AppContext {
        config,
        pool,
        ledger,
        escrow,
        jobs,
        orchestrator,
        scheduler,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database pool ready, migrations applied");
    Ok(pool)
}
