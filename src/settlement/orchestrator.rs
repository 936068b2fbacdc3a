use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::gateway::{SettlementGateway, SettlementRequest, GATEWAY_BREAKER_KEY};
use super::models::{JobOutcome, SettlementJob};
use super::store::JobStore;
use crate::breaker::{CircuitBreaker, Guard};
use crate::error::{AppError, AppResult, EscrowError, GatewayError, SettlementError};
use crate::escrow::{EscrowManager, EscrowReservation, Reserve};
use crate::idempotency::{Begin, IdempotencyStore};
use crate::ledger::{AccountId, EntryDraft, ReferenceKind};
use crate::retry::RetryExecutor;

/// Drives a single settlement job through reserve -> gateway -> capture.
/// Safe to call any number of times for the same job: the idempotency claim
/// and the guarded status transitions make redelivery a no-op.
pub struct SettlementOrchestrator {
    jobs: Arc<dyn JobStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    escrow: Arc<EscrowManager>,
    breaker: Arc<CircuitBreaker>,
    gateway: Arc<dyn SettlementGateway>,
    retry: RetryExecutor,
}

impl SettlementOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        escrow: Arc<EscrowManager>,
        breaker: Arc<CircuitBreaker>,
        gateway: Arc<dyn SettlementGateway>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            jobs,
            idempotency,
            escrow,
            breaker,
            gateway,
            retry,
        }
    }

    pub async fn settle(&self, job_id: Uuid) -> AppResult<JobOutcome> {
        let job = self
            .jobs
            .job(job_id)
            .await?
            .ok_or(SettlementError::JobNotFound(job_id))?;

        // terminal jobs are immutable; redelivery returns the recorded outcome
        if job.status.is_terminal() {
            return Ok(Self::terminal_outcome(&job));
        }

        let key = job.idempotency_key();
        match self.idempotency.begin(&key, &job.fingerprint()).await? {
            Begin::Fresh => {}
            Begin::Duplicate(Some(result)) => {
                info!(job_id = %job.id, "settlement already completed, returning stored outcome");
                return serde_json::from_value(result)
                    .map_err(|e| AppError::Internal(format!("stored outcome unreadable: {e}")));
            }
            Begin::Duplicate(None) => {
                return Ok(JobOutcome::Deferred {
                    cause: "settlement in flight on another worker".to_string(),
                });
            }
            Begin::Conflict => return Err(AppError::IdempotencyConflict { key }),
        }

        // claim is ours from here on; every exit path must complete or abandon it
        let job = match self.jobs.mark_processing(job.id).await {
            Ok(job) => job,
            Err(err) => {
                self.idempotency.abandon(&key).await?;
                return Err(err);
            }
        };

        let reservation = match self
            .escrow
            .reserve(job.business_id, job.amount_minor, job.id)
            .await
        {
            Ok(Reserve::Reserved(reservation)) => reservation,
            Ok(Reserve::InsufficientFunds {
                requested,
                available,
            }) => {
                // a business outcome, not an infrastructure failure: fail
                // permanently instead of retrying into the same empty account
                let reason = format!(
                    "insufficient escrow funds: requested {requested}, available {available}"
                );
                return self.finish_failed(&job, &key, None, reason).await;
            }
            Err(AppError::Escrow(EscrowError::BusinessLockBusy(_))) => {
                // contention with another settlement for the same business is
                // ordinary; a later tick tries again
                warn!(job_id = %job.id, business_id = %job.business_id,
                    "business lock contended, deferring settlement");
                return self.defer(&job, &key, None, "business lock contention").await;
            }
            Err(err) => {
                // free the job and the claim before surfacing a systemic failure
                self.jobs.requeue(job.id).await?;
                self.idempotency.abandon(&key).await?;
                return Err(err);
            }
        };

        if self.breaker.guard(GATEWAY_BREAKER_KEY).await? == Guard::Rejected {
            warn!(job_id = %job.id, "gateway circuit open, deferring settlement");
            return self
                .defer(&job, &key, Some(&reservation), "gateway circuit open")
                .await;
        }

        let request = SettlementRequest {
            job_id: job.id,
            business_id: job.business_id,
            recipient_id: job.recipient_id,
            amount_minor: job.amount_minor,
            currency: job.currency.clone(),
        };
        let settled = self
            .retry
            .run("gateway-settle", || {
                let request = request.clone();
                async move {
                    match self.gateway.settle(&request).await {
                        Ok(receipt) => {
                            self.breaker.record_success(GATEWAY_BREAKER_KEY).await?;
                            Ok(receipt)
                        }
                        Err(err) => {
                            // declines mean the rail answered; only outages
                            // count against its health
                            if err.is_transient() {
                                self.breaker.record_failure(GATEWAY_BREAKER_KEY).await?;
                            }
                            Err(err)
                        }
                    }
                }
            })
            .await;

        match settled {
            Ok(receipt) => {
                let entries = vec![
                    EntryDraft::debit(
                        AccountId::escrow(job.business_id),
                        job.amount_minor,
                        &job.currency,
                        ReferenceKind::Job,
                        job.id,
                    ),
                    EntryDraft::credit(
                        AccountId::payout(job.business_id),
                        job.amount_minor,
                        &job.currency,
                        ReferenceKind::Job,
                        job.id,
                    ),
                ];
                self.jobs
                    .finalize_success(job.id, reservation.id, &receipt.reference, entries)
                    .await?;

                let outcome = JobOutcome::Succeeded {
                    gateway_reference: receipt.reference.clone(),
                };
                self.idempotency
                    .complete(&key, serde_json::to_value(&outcome)?)
                    .await?;
                info!(
                    job_id = %job.id,
                    business_id = %job.business_id,
                    amount_minor = job.amount_minor,
                    gateway_reference = %receipt.reference,
                    "settlement succeeded"
                );
                Ok(outcome)
            }
            Err(AppError::Gateway(GatewayError::Declined(reason))) => {
                // the rail is healthy, it just said no
                self.breaker.record_success(GATEWAY_BREAKER_KEY).await?;
                self.finish_failed(&job, &key, Some(reservation.id), format!("declined: {reason}"))
                    .await
            }
            Err(err) if err.is_transient() => {
                warn!(job_id = %job.id, error = %err, "gateway unreachable, deferring settlement");
                self.defer(&job, &key, Some(&reservation), "gateway retries exhausted")
                    .await
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "settlement attempt failed unexpectedly");
                self.escrow.release(reservation.id).await?;
                self.jobs.requeue(job.id).await?;
                self.idempotency.abandon(&key).await?;
                Err(err)
            }
        }
    }

    /// Permanent failure: release the hold, persist the reason, store the
    /// outcome so redelivery short-circuits.
    async fn finish_failed(
        &self,
        job: &SettlementJob,
        key: &str,
        reservation_id: Option<Uuid>,
        reason: String,
    ) -> AppResult<JobOutcome> {
        self.jobs
            .finalize_failure(job.id, reservation_id, &reason)
            .await?;
        let outcome = JobOutcome::Failed { reason };
        self.idempotency
            .complete(key, serde_json::to_value(&outcome)?)
            .await?;
        warn!(job_id = %job.id, business_id = %job.business_id, outcome = ?outcome, "settlement failed");
        Ok(outcome)
    }

    /// Not the business's fault: put everything back the way it was so a
    /// later tick can try again. No outcome is stored.
    async fn defer(
        &self,
        job: &SettlementJob,
        key: &str,
        reservation: Option<&EscrowReservation>,
        cause: &str,
    ) -> AppResult<JobOutcome> {
        if let Some(reservation) = reservation {
            self.escrow.release(reservation.id).await?;
        }
        self.jobs.requeue(job.id).await?;
        self.idempotency.abandon(key).await?;
        Ok(JobOutcome::Deferred {
            cause: cause.to_string(),
        })
    }

    fn terminal_outcome(job: &SettlementJob) -> JobOutcome {
        match &job.gateway_reference {
            Some(reference) => JobOutcome::Succeeded {
                gateway_reference: reference.clone(),
            },
            None => JobOutcome::Failed {
                reason: job
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "failed".to_string()),
            },
        }
    }
}
