pub mod memory;
pub mod postgres;

pub use memory::MemoryLockManager;
pub use postgres::PgLockManager;

use async_trait::async_trait;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::AppResult;

/// Proof of holding a lock. Leases are time-boxed: the holder must renew
/// before the TTL elapses or the lock becomes reclaimable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_key: String,
    pub holder_id: Uuid,
}

/// `Busy` is an expected outcome, not an error — callers treat it as
/// "try again later".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired(Lease),
    Busy,
}

/// Distributed mutual exclusion with TTL and heartbeat renewal. Exactly one
/// live holder per resource key; expiry is the safety net against a crashed
/// holder.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Single attempt; does not wait.
    async fn acquire(&self, resource_key: &str, ttl: Duration) -> AppResult<Acquire>;

    /// Extend the lease; returns false if the lease was lost (expired and
    /// reclaimed by someone else).
    async fn renew(&self, lease: &Lease, ttl: Duration) -> AppResult<bool>;

    async fn release(&self, lease: Lease) -> AppResult<()>;

    /// Bounded-wait acquire: polls until `wait_timeout` elapses, then reports
    /// `Busy`. Never blocks indefinitely.
    async fn acquire_wait(
        &self,
        resource_key: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> AppResult<Acquire> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            match self.acquire(resource_key, ttl).await? {
                Acquire::Acquired(lease) => return Ok(Acquire::Acquired(lease)),
                Acquire::Busy => {
                    if Instant::now() >= deadline {
                        return Ok(Acquire::Busy);
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(wait_timeout)).await;
                }
            }
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Conventional resource keys.
pub fn schedule_key(schedule_id: Uuid) -> String {
    format!("schedule:{schedule_id}")
}

pub fn business_key(business_id: Uuid) -> String {
    format!("business:{business_id}")
}
