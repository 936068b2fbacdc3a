use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{Acquire, Lease, LockManager};
use crate::error::AppResult;

struct Holder {
    holder_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// In-memory lock manager for tests. Single-mutex state gives the same
/// one-live-holder guarantee the Postgres upsert provides.
#[derive(Default)]
pub struct MemoryLockManager {
    locks: Mutex<HashMap<String, Holder>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ttl_chrono(ttl: Duration) -> ChronoDuration {
    ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(600))
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, resource_key: &str, ttl: Duration) -> AppResult<Acquire> {
        let now = Utc::now();
        let mut locks = self.locks.lock();

        if let Some(holder) = locks.get(resource_key) {
            if holder.expires_at > now {
                return Ok(Acquire::Busy);
            }
        }

        let holder_id = Uuid::new_v4();
        locks.insert(
            resource_key.to_string(),
            Holder {
                holder_id,
                expires_at: now + ttl_chrono(ttl),
            },
        );
        Ok(Acquire::Acquired(Lease {
            resource_key: resource_key.to_string(),
            holder_id,
        }))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> AppResult<bool> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        match locks.get_mut(&lease.resource_key) {
            Some(holder) if holder.holder_id == lease.holder_id && holder.expires_at > now => {
                holder.expires_at = now + ttl_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: Lease) -> AppResult<()> {
        let mut locks = self.locks.lock();
        if let Some(holder) = locks.get(&lease.resource_key) {
            if holder.holder_id == lease.holder_id {
                locks.remove(&lease.resource_key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let locks = MemoryLockManager::new();
        let ttl = Duration::from_secs(60);

        let lease = match locks.acquire("schedule:1", ttl).await.unwrap() {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy => panic!("first acquire must succeed"),
        };
        assert_eq!(locks.acquire("schedule:1", ttl).await.unwrap(), Acquire::Busy);

        locks.release(lease).await.unwrap();
        assert!(matches!(
            locks.acquire("schedule:1", ttl).await.unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable_and_old_lease_dies() {
        let locks = MemoryLockManager::new();

        let stale = match locks.acquire("schedule:1", Duration::ZERO).await.unwrap() {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy => panic!(),
        };

        // crashed holder's lease expired; a new worker takes over
        let fresh = match locks
            .acquire("schedule:1", Duration::from_secs(60))
            .await
            .unwrap()
        {
            Acquire::Acquired(lease) => lease,
            Acquire::Busy => panic!("expired lock must be reclaimable"),
        };

        assert!(!locks.renew(&stale, Duration::from_secs(60)).await.unwrap());
        assert!(locks.renew(&fresh, Duration::from_secs(60)).await.unwrap());

        // releasing the dead lease must not evict the live holder
        locks.release(stale).await.unwrap();
        assert_eq!(
            locks
                .acquire("schedule:1", Duration::from_secs(60))
                .await
                .unwrap(),
            Acquire::Busy
        );
    }

    #[tokio::test]
    async fn bounded_wait_times_out_as_busy() {
        let locks = MemoryLockManager::new();
        let ttl = Duration::from_secs(60);
        let _held = locks.acquire("business:1", ttl).await.unwrap();

        let started = std::time::Instant::now();
        let outcome = locks
            .acquire_wait("business:1", ttl, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, Acquire::Busy);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn independent_resources_do_not_contend() {
        let locks = MemoryLockManager::new();
        let ttl = Duration::from_secs(60);
        assert!(matches!(
            locks.acquire("business:1", ttl).await.unwrap(),
            Acquire::Acquired(_)
        ));
        assert!(matches!(
            locks.acquire("business:2", ttl).await.unwrap(),
            Acquire::Acquired(_)
        ));
    }
}
