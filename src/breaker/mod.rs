pub mod memory;
pub mod postgres;

pub use memory::MemoryBreakerStore;
pub use postgres::PgBreakerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "breaker_state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted per-dependency health record. The key is scoped per logical
/// dependency (one per payment rail), never per request, so failures
/// aggregate meaningfully.
#[derive(Debug, Clone)]
pub struct BreakerRecord {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    fn closed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

/// Storage strategy for breaker state, constructed once at startup.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, key: &str) -> AppResult<Option<BreakerRecord>>;
    async fn save(&self, record: &BreakerRecord) -> AppResult<()>;
}

/// Whether a guarded call may proceed. `Rejected` is a value, not an error:
/// it means the dependency is degraded and the work should be deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Allowed,
    Rejected,
}

/// Per-dependency failure-aggregating guard. Closed passes calls through;
/// `failure_threshold` consecutive failures open it; after `open_timeout`
/// the next call probes half-open; `half_open_successes` consecutive probe
/// successes close it again, while any probe failure reopens it.
pub struct CircuitBreaker {
    store: Arc<dyn BreakerStore>,
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn BreakerStore>,
        failure_threshold: u32,
        open_timeout: Duration,
        half_open_successes: u32,
    ) -> Self {
        Self {
            store,
            failure_threshold,
            open_timeout,
            half_open_successes,
        }
    }

    async fn record(&self, key: &str) -> AppResult<BreakerRecord> {
        Ok(self
            .store
            .load(key)
            .await?
            .unwrap_or_else(|| BreakerRecord::closed(key)))
    }

    pub async fn guard(&self, key: &str) -> AppResult<Guard> {
        let mut record = self.record(key).await?;
        match record.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(Guard::Allowed),
            BreakerState::Open => {
                let opened_at = record.opened_at.unwrap_or_else(Utc::now);
                let probe_at =
                    opened_at + chrono::Duration::milliseconds(self.open_timeout.as_millis() as i64);
                if Utc::now() >= probe_at {
                    info!(key, "circuit breaker half-open, allowing probe calls");
                    record.state = BreakerState::HalfOpen;
                    record.success_count = 0;
                    self.store.save(&record).await?;
                    Ok(Guard::Allowed)
                } else {
                    Ok(Guard::Rejected)
                }
            }
        }
    }

    pub async fn record_success(&self, key: &str) -> AppResult<()> {
        let mut record = self.record(key).await?;
        match record.state {
            BreakerState::Closed => {
                // sustained success clears the failure streak
                if record.failure_count > 0 {
                    record.failure_count = 0;
                    self.store.save(&record).await?;
                }
            }
            BreakerState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.half_open_successes {
                    info!(key, "circuit breaker closed after successful probes");
                    record = BreakerRecord::closed(key);
                }
                self.store.save(&record).await?;
            }
            BreakerState::Open => {}
        }
        Ok(())
    }

    pub async fn record_failure(&self, key: &str) -> AppResult<()> {
        let now = Utc::now();
        let mut record = self.record(key).await?;
        record.last_failure_at = Some(now);
        match record.state {
            BreakerState::Closed => {
                record.failure_count += 1;
                if record.failure_count >= self.failure_threshold {
                    warn!(
                        key,
                        failures = record.failure_count,
                        "circuit breaker opened"
                    );
                    record.state = BreakerState::Open;
                    record.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                // one probe failure sends it straight back to open
                warn!(key, "probe call failed, circuit breaker reopened");
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                record.success_count = 0;
            }
            BreakerState::Open => {}
        }
        self.store.save(&record).await?;
        Ok(())
    }

    /// Current state, for observability.
    pub async fn state(&self, key: &str) -> AppResult<BreakerState> {
        Ok(self.record(key).await?.state)
    }
}
