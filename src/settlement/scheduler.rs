use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::{JobKind, JobOutcome};
use super::orchestrator::SettlementOrchestrator;
use super::store::JobStore;
use crate::config::Config;
use crate::error::AppResult;
use crate::escrow::EscrowManager;
use crate::idempotency::IdempotencyStore;
use crate::ledger::LedgerStore;
use crate::lock::{schedule_key, Acquire, LockManager};
use crate::reconciliation::ReconciliationJob;

/// Background loops of the worker: settlement ticks per job kind, periodic
/// sweeps (stale reservations, stuck jobs, due postings, expired idempotency
/// keys) and reconciliation. Every loop is safe to run on several workers at
/// once; the schedule lock and the guarded transitions do the arbitration.
pub struct SettlementScheduler {
    config: Config,
    orchestrator: Arc<SettlementOrchestrator>,
    jobs: Arc<dyn JobStore>,
    locks: Arc<dyn LockManager>,
    escrow: Arc<EscrowManager>,
    ledger: Arc<dyn LedgerStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    reconciliation: Arc<ReconciliationJob>,
}

impl SettlementScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        orchestrator: Arc<SettlementOrchestrator>,
        jobs: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        escrow: Arc<EscrowManager>,
        ledger: Arc<dyn LedgerStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        reconciliation: Arc<ReconciliationJob>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            jobs,
            locks,
            escrow,
            ledger,
            idempotency,
            reconciliation,
        }
    }

    /// Spawn all background loops. The handles never resolve in normal
    /// operation; the caller keeps them alive for the process lifetime.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_settlement_loop(),
            self.spawn_sweep_loop(),
            self.spawn_reconciliation_loop(),
        ]
    }

    fn spawn_settlement_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(scheduler.config.settlement_tick);
            loop {
                tick.tick().await;
                for kind in [JobKind::Payroll, JobKind::Payment] {
                    if let Err(e) = scheduler.run_settlement_tick(kind).await {
                        error!(?kind, error = %e, "settlement tick failed");
                    }
                }
            }
        })
    }

    fn spawn_sweep_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(scheduler.config.reservation_cleanup_timeout);
            loop {
                tick.tick().await;
                if let Err(e) = scheduler.run_sweeps().await {
                    error!(error = %e, "maintenance sweep failed");
                }
            }
        })
    }

    fn spawn_reconciliation_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(scheduler.config.reconciliation_interval);
            loop {
                tick.tick().await;
                if let Err(e) = scheduler.reconciliation.run().await {
                    error!(error = %e, "reconciliation run failed");
                }
            }
        })
    }

    /// One pass over all schedules of a kind with due jobs. A tick with
    /// nothing due is a no-op, so overlapping ticks are harmless.
    pub async fn run_settlement_tick(&self, kind: JobKind) -> AppResult<()> {
        let schedules = self.jobs.due_schedules(kind, Utc::now()).await?;
        if schedules.is_empty() {
            debug!(?kind, "no due schedules");
            return Ok(());
        }
        for schedule_id in schedules {
            self.process_schedule(kind, schedule_id).await?;
        }
        Ok(())
    }

    /// Settle all due jobs of one schedule under its lock. `Busy` means
    /// another worker already owns this schedule; skipping it is correct,
    /// not a failure.
    async fn process_schedule(&self, kind: JobKind, schedule_id: Uuid) -> AppResult<()> {
        let lease = match self
            .locks
            .acquire(&schedule_key(schedule_id), self.config.schedule_lock_ttl)
            .await?
        {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy => {
                debug!(%schedule_id, "schedule locked by another worker, skipping");
                return Ok(());
            }
        };

        // heartbeat keeps the lease alive across a long batch
        let heartbeat = {
            let locks = self.locks.clone();
            let lease = lease.clone();
            let ttl = self.config.schedule_lock_ttl;
            let period = self.config.lock_heartbeat;
            tokio::spawn(async move {
                let mut tick = interval(period);
                tick.tick().await; // first tick is immediate
                loop {
                    tick.tick().await;
                    match locks.renew(&lease, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(resource = %lease.resource_key, "schedule lease lost");
                            break;
                        }
                        Err(e) => {
                            warn!(resource = %lease.resource_key, error = %e, "lease renewal failed");
                            break;
                        }
                    }
                }
            })
        };

        let result = self.settle_due_jobs(kind, schedule_id).await;

        heartbeat.abort();
        self.locks.release(lease).await?;
        result
    }

    async fn settle_due_jobs(&self, kind: JobKind, schedule_id: Uuid) -> AppResult<()> {
        let due = self.jobs.due_jobs(kind, schedule_id, Utc::now()).await?;
        info!(?kind, %schedule_id, jobs = due.len(), "processing due settlement jobs");

        for job in due {
            match self.orchestrator.settle(job.id).await {
                Ok(JobOutcome::Succeeded { .. }) | Ok(JobOutcome::Failed { .. }) => {}
                Ok(JobOutcome::Deferred { cause }) => {
                    debug!(job_id = %job.id, cause, "settlement deferred");
                }
                Err(e) => {
                    // one bad job must not starve the rest of the batch
                    error!(job_id = %job.id, error = %e, "settlement errored");
                }
            }
        }
        Ok(())
    }

    /// Housekeeping: orphaned holds, stuck jobs, matured postings, expired
    /// idempotency keys.
    pub async fn run_sweeps(&self) -> AppResult<()> {
        let now = Utc::now();

        let released = self.escrow.sweep_stale_reservations().await?;
        let cutoff = now
            - chrono::Duration::milliseconds(self.config.stuck_job_timeout.as_millis() as i64);
        let requeued = self.jobs.requeue_stuck(cutoff).await?;
        let posted = self.ledger.post_due(now).await?;
        let purged = self.idempotency.purge_expired(now).await?;

        if released + requeued + posted + purged > 0 {
            info!(released, requeued, posted, purged, "maintenance sweep");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreaker, MemoryBreakerStore};
    use crate::escrow::{EntryMethod, MemoryEscrowStore};
    use crate::idempotency::MemoryIdempotencyStore;
    use crate::ledger::{AccountId, MemoryLedgerStore};
    use crate::lock::MemoryLockManager;
    use crate::reconciliation::MemoryBalanceCache;
    use crate::retry::{RetryExecutor, RetryPolicy};
    use crate::settlement::gateway::MockGateway;
    use crate::settlement::memory::MemoryJobStore;
    use crate::settlement::models::{JobStatus, NewJob};
    use std::time::Duration;

    struct Fixture {
        scheduler: SettlementScheduler,
        jobs: Arc<MemoryJobStore>,
        escrow: Arc<EscrowManager>,
        locks: Arc<MemoryLockManager>,
        ledger: Arc<MemoryLedgerStore>,
    }

    fn fixture() -> Fixture {
        let config = Config {
            retry_initial_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            ..Config::default()
        };
        let ledger = Arc::new(MemoryLedgerStore::immediate());
        let escrow_store = Arc::new(MemoryEscrowStore::new(ledger.clone()));
        let locks = Arc::new(MemoryLockManager::new());
        let escrow = Arc::new(EscrowManager::new(
            ledger.clone(),
            escrow_store.clone(),
            locks.clone(),
            config.clone(),
        ));
        let jobs = Arc::new(MemoryJobStore::new(escrow_store));
        let idempotency = Arc::new(MemoryIdempotencyStore::new(
            config.idempotency_ttl,
            config.dedup_window,
            config.stuck_job_timeout,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryBreakerStore::new()),
            config.breaker_failure_threshold,
            config.breaker_open_timeout,
            config.breaker_half_open_successes,
        ));
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            jobs.clone(),
            idempotency.clone(),
            escrow.clone(),
            breaker,
            Arc::new(MockGateway::reliable()),
            RetryExecutor::new(RetryPolicy::from_config(&config)),
        ));
        let reconciliation = Arc::new(ReconciliationJob::new(
            ledger.clone(),
            Arc::new(MemoryBalanceCache::new()),
            config.reconciliation_auto_fix_max_minor,
            &config.currency,
        ));
        let scheduler = SettlementScheduler::new(
            config,
            orchestrator,
            jobs.clone(),
            locks.clone(),
            escrow.clone(),
            ledger.clone(),
            idempotency,
            reconciliation,
        );
        Fixture {
            scheduler,
            jobs,
            escrow,
            locks,
            ledger,
        }
    }

    async fn funded_due_job(f: &Fixture, amount_minor: i64) -> (Uuid, Uuid) {
        let business = Uuid::new_v4();
        let deposit = f
            .escrow
            .record_deposit(business, 1_000_000, EntryMethod::Manual, None)
            .await
            .unwrap();
        f.escrow.confirm_deposit(deposit.id).await.unwrap();

        let job = f
            .jobs
            .enqueue(NewJob {
                kind: JobKind::Payroll,
                business_id: business,
                schedule_id: Uuid::new_v4(),
                recipient_id: Uuid::new_v4(),
                period_key: "2025-08".to_string(),
                amount_minor,
                currency: "ZAR".to_string(),
                calculation_version: 1,
                due_at: Utc::now() - chrono::Duration::minutes(1),
            })
            .await
            .unwrap()
            .unwrap();
        (business, job.id)
    }

    #[tokio::test]
    async fn tick_settles_due_jobs() {
        let f = fixture();
        let (business, job_id) = funded_due_job(&f, 300_000).await;

        f.scheduler
            .run_settlement_tick(JobKind::Payroll)
            .await
            .unwrap();

        assert_eq!(
            f.jobs.job(job_id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(
            f.ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            685_000
        );
    }

    #[tokio::test]
    async fn repeated_ticks_are_no_ops() {
        let f = fixture();
        let (business, _) = funded_due_job(&f, 300_000).await;

        for _ in 0..3 {
            f.scheduler
                .run_settlement_tick(JobKind::Payroll)
                .await
                .unwrap();
        }
        // one ledger effect despite three ticks
        assert_eq!(
            f.ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            685_000
        );

        // and a tick with nothing due at all
        f.scheduler
            .run_settlement_tick(JobKind::Payment)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn held_schedule_lock_skips_the_schedule() {
        let f = fixture();
        let (business, job_id) = funded_due_job(&f, 300_000).await;
        let job = f.jobs.job(job_id).await.unwrap().unwrap();

        // another worker owns the schedule
        let lease = match f
            .locks
            .acquire(&schedule_key(job.schedule_id), Duration::from_secs(60))
            .await
            .unwrap()
        {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy => panic!("lock must be free"),
        };

        f.scheduler
            .run_settlement_tick(JobKind::Payroll)
            .await
            .unwrap();
        assert_eq!(
            f.jobs.job(job_id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );

        // released, the next tick picks it up
        f.locks.release(lease).await.unwrap();
        f.scheduler
            .run_settlement_tick(JobKind::Payroll)
            .await
            .unwrap();
        assert_eq!(
            f.jobs.job(job_id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(
            f.ledger.balance(&AccountId::escrow(business)).await.unwrap(),
            685_000
        );
    }

    #[tokio::test]
    async fn sweeps_cover_all_housekeeping() {
        let f = fixture();
        // nothing to do: must still succeed
        f.scheduler.run_sweeps().await.unwrap();
    }
}
