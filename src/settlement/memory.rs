use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::models::{JobKind, JobStatus, NewJob, SettlementJob};
use super::store::JobStore;
use crate::error::{AppResult, SettlementError};
use crate::escrow::{EscrowStore, MemoryEscrowStore};
use crate::ledger::EntryDraft;

/// In-memory job store for tests, finalizing against the shared in-memory
/// escrow store (which carries the ledger).
pub struct MemoryJobStore {
    escrow: Arc<MemoryEscrowStore>,
    jobs: Mutex<HashMap<Uuid, SettlementJob>>,
}

impl MemoryJobStore {
    pub fn new(escrow: Arc<MemoryEscrowStore>) -> Self {
        Self {
            escrow,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn natural_key(job: &SettlementJob) -> (JobKind, Uuid, Uuid, String) {
        (
            job.kind,
            job.schedule_id,
            job.recipient_id,
            job.period_key.clone(),
        )
    }

    fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        reason: Option<&str>,
    ) -> AppResult<SettlementJob> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id).ok_or(SettlementError::JobNotFound(id))?;
        if job.status != from {
            return Err(SettlementError::InvalidState {
                id,
                current: format!("{:?}", job.status),
                expected: format!("{from:?}"),
            }
            .into());
        }
        job.status = to;
        let now = Utc::now();
        match to {
            JobStatus::Processing => job.processing_at = Some(now),
            JobStatus::Pending => job.processing_at = None,
            JobStatus::Succeeded | JobStatus::Failed => {
                job.settled_at = Some(now);
                job.failure_reason = reason.map(str::to_string);
            }
        }
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> AppResult<Option<SettlementJob>> {
        let mut jobs = self.jobs.lock();
        let duplicate = jobs.values().any(|existing| {
            existing.kind == new.kind
                && existing.schedule_id == new.schedule_id
                && existing.recipient_id == new.recipient_id
                && existing.period_key == new.period_key
        });
        if duplicate {
            return Ok(None);
        }

        let job = SettlementJob {
            id: Uuid::new_v4(),
            kind: new.kind,
            business_id: new.business_id,
            schedule_id: new.schedule_id,
            recipient_id: new.recipient_id,
            period_key: new.period_key,
            amount_minor: new.amount_minor,
            currency: new.currency,
            calculation_version: new.calculation_version,
            status: JobStatus::Pending,
            failure_reason: None,
            gateway_reference: None,
            due_at: new.due_at,
            processing_at: None,
            settled_at: None,
            created_at: Utc::now(),
        };
        jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn job(&self, id: Uuid) -> AppResult<Option<SettlementJob>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn due_schedules(&self, kind: JobKind, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let jobs = self.jobs.lock();
        let mut schedules: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.kind == kind && j.status == JobStatus::Pending && j.due_at <= now)
            .map(|j| j.schedule_id)
            .collect();
        schedules.sort_unstable();
        schedules.dedup();
        Ok(schedules)
    }

    async fn due_jobs(
        &self,
        kind: JobKind,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementJob>> {
        let jobs = self.jobs.lock();
        let mut due: Vec<SettlementJob> = jobs
            .values()
            .filter(|j| {
                j.kind == kind
                    && j.schedule_id == schedule_id
                    && j.status == JobStatus::Pending
                    && j.due_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|j| j.created_at);
        Ok(due)
    }

    async fn mark_processing(&self, id: Uuid) -> AppResult<SettlementJob> {
        self.transition(id, JobStatus::Pending, JobStatus::Processing, None)
    }

    async fn requeue(&self, id: Uuid) -> AppResult<()> {
        self.transition(id, JobStatus::Processing, JobStatus::Pending, None)?;
        Ok(())
    }

    async fn requeue_stuck(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut jobs = self.jobs.lock();
        let mut reclaimed = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.processing_at.map(|t| t <= cutoff).unwrap_or(true)
            {
                job.status = JobStatus::Pending;
                job.processing_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn finalize_success(
        &self,
        job_id: Uuid,
        reservation_id: Uuid,
        gateway_reference: &str,
        entries: Vec<EntryDraft>,
    ) -> AppResult<SettlementJob> {
        // capture first: if the reservation is not held, the job must not
        // reach succeeded
        self.escrow.capture(reservation_id, entries).await?;
        let job = self.transition(job_id, JobStatus::Processing, JobStatus::Succeeded, None)?;
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .get_mut(&job_id)
            .ok_or(SettlementError::JobNotFound(job_id))?;
        stored.gateway_reference = Some(gateway_reference.to_string());
        Ok(SettlementJob {
            gateway_reference: stored.gateway_reference.clone(),
            ..job
        })
    }

    async fn finalize_failure(
        &self,
        job_id: Uuid,
        reservation_id: Option<Uuid>,
        reason: &str,
    ) -> AppResult<SettlementJob> {
        if let Some(reservation_id) = reservation_id {
            self.escrow.release(reservation_id).await?;
        }
        self.transition(job_id, JobStatus::Processing, JobStatus::Failed, Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;

    fn store() -> MemoryJobStore {
        let ledger = Arc::new(MemoryLedgerStore::immediate());
        MemoryJobStore::new(Arc::new(MemoryEscrowStore::new(ledger)))
    }

    fn new_job(schedule: Uuid, recipient: Uuid, period: &str) -> NewJob {
        NewJob {
            kind: JobKind::Payroll,
            business_id: Uuid::new_v4(),
            schedule_id: schedule,
            recipient_id: recipient,
            period_key: period.to_string(),
            amount_minor: 50_000,
            currency: "ZAR".to_string(),
            calculation_version: 1,
            due_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_on_the_natural_key() {
        let store = store();
        let schedule = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        assert!(store
            .enqueue(new_job(schedule, recipient, "2025-08"))
            .await
            .unwrap()
            .is_some());
        // overlapping tick delivers the same period again
        assert!(store
            .enqueue(new_job(schedule, recipient, "2025-08"))
            .await
            .unwrap()
            .is_none());
        // next period is a new job
        assert!(store
            .enqueue(new_job(schedule, recipient, "2025-09"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stuck_processing_jobs_are_reclaimed() {
        let store = store();
        let job = store
            .enqueue(new_job(Uuid::new_v4(), Uuid::new_v4(), "2025-08"))
            .await
            .unwrap()
            .unwrap();
        store.mark_processing(job.id).await.unwrap();

        // cutoff in the future covers the just-started job
        let reclaimed = store
            .requeue_stuck(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(
            store.job(job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        // and it shows up as due again
        assert_eq!(
            store
                .due_schedules(JobKind::Payroll, Utc::now())
                .await
                .unwrap(),
            vec![job.schedule_id]
        );
    }

    #[tokio::test]
    async fn terminal_jobs_cannot_move() {
        let store = store();
        let job = store
            .enqueue(new_job(Uuid::new_v4(), Uuid::new_v4(), "2025-08"))
            .await
            .unwrap()
            .unwrap();
        store.mark_processing(job.id).await.unwrap();
        store
            .finalize_failure(job.id, None, "declined by rail")
            .await
            .unwrap();

        assert!(store.mark_processing(job.id).await.is_err());
        assert!(store.requeue(job.id).await.is_err());
        let stored = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("declined by rail"));
    }
}
