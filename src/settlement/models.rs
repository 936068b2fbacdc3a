use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use uuid::Uuid;

use crate::idempotency;

/// Payroll and ad-hoc payment jobs share one settlement path; the kind only
/// matters to the schedule that creates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "job_kind", rename_all = "lowercase")]
pub enum JobKind {
    Payroll,
    Payment,
}

/// Monotonic except for the processing -> pending recovery edge used when a
/// worker dies mid-flight. Succeeded and Failed are terminal and immutable;
/// corrections are new compensating jobs, never reprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// One job per (schedule, recipient, pay period).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettlementJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub business_id: Uuid,
    pub schedule_id: Uuid,
    pub recipient_id: Uuid,
    pub period_key: String,
    pub amount_minor: i64,
    pub currency: String,
    /// Bumped when the amount formula changes; stale computed amounts are
    /// settled under a new key so the old attempt cannot satisfy the new one.
    pub calculation_version: i32,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    /// Rail-side reference, set on success.
    pub gateway_reference: Option<String>,
    pub due_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SettlementJob {
    pub fn idempotency_key(&self) -> String {
        format!("settle:{}:v{}", self.id, self.calculation_version)
    }

    pub fn fingerprint(&self) -> String {
        idempotency::fingerprint([
            self.id.to_string(),
            self.business_id.to_string(),
            self.recipient_id.to_string(),
            self.amount_minor.to_string(),
            self.calculation_version.to_string(),
        ])
    }
}

/// Job as submitted by the payroll/payment calculators (external to this
/// core). Creation is idempotent on the natural key.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub business_id: Uuid,
    pub schedule_id: Uuid,
    pub recipient_id: Uuid,
    pub period_key: String,
    pub amount_minor: i64,
    pub currency: String,
    pub calculation_version: i32,
    pub due_at: DateTime<Utc>,
}

/// Terminal or deferred result of one settlement attempt. Stored (terminal
/// variants only) as the idempotency result so redelivery short-circuits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { gateway_reference: String },
    Failed { reason: String },
    /// Not the business's fault (circuit open, outage, lock contention);
    /// the job stays pending for a later tick and no outcome is stored.
    Deferred { cause: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(calculation_version: i32) -> SettlementJob {
        SettlementJob {
            id: Uuid::nil(),
            kind: JobKind::Payroll,
            business_id: Uuid::new_v4(),
            schedule_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            period_key: "2025-08".to_string(),
            amount_minor: 985_000,
            currency: "ZAR".to_string(),
            calculation_version,
            status: JobStatus::Pending,
            failure_reason: None,
            gateway_reference: None,
            due_at: Utc::now(),
            processing_at: None,
            settled_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn key_changes_with_calculation_version() {
        assert_eq!(
            job(1).idempotency_key(),
            "settle:00000000-0000-0000-0000-000000000000:v1"
        );
        assert_ne!(job(1).idempotency_key(), job(2).idempotency_key());
    }

    #[test]
    fn outcome_round_trips_through_json() {
        let outcome = JobOutcome::Failed {
            reason: "insufficient escrow funds".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        let back: JobOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, outcome);
    }
}
