use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use super::{Begin, IdempotencyStore};
use crate::error::AppResult;

#[derive(Debug, Clone)]
struct Record {
    fingerprint: String,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Record {
    /// A claim with no outcome whose worker has been silent past the claim
    /// TTL belongs to a crashed run and may be reclaimed.
    fn is_stale_claim(&self, claim_ttl: ChronoDuration, now: DateTime<Utc>) -> bool {
        self.result.is_none() && self.created_at + claim_ttl <= now
    }
}

/// In-memory idempotency store for tests. The single mutex makes
/// check-then-reserve atomic the way the unique-constraint insert does in
/// Postgres.
pub struct MemoryIdempotencyStore {
    ttl: ChronoDuration,
    dedup_window: ChronoDuration,
    claim_ttl: ChronoDuration,
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl: Duration, dedup_window: Duration, claim_ttl: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(7)),
            dedup_window: ChronoDuration::from_std(dedup_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
            claim_ttl: ChronoDuration::from_std(claim_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(2)),
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(&self, key: &str, fingerprint: &str) -> AppResult<Begin> {
        let now = Utc::now();
        let mut records = self.records.lock();

        if let Some(existing) = records.get(key) {
            if existing.expires_at <= now || existing.is_stale_claim(self.claim_ttl, now) {
                records.remove(key);
            } else if existing.fingerprint != fingerprint {
                return Ok(Begin::Conflict);
            } else {
                return Ok(Begin::Duplicate(existing.result.clone()));
            }
        }

        // content-based window: a different key carrying identical inputs is
        // a client retry that failed to reuse its key
        let window_start = now - self.dedup_window;
        if let Some(twin) = records.values().find(|r| {
            r.fingerprint == fingerprint
                && r.created_at > window_start
                && !r.is_stale_claim(self.claim_ttl, now)
        }) {
            return Ok(Begin::Duplicate(twin.result.clone()));
        }

        records.insert(
            key.to_string(),
            Record {
                fingerprint: fingerprint.to_string(),
                result: None,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
        Ok(Begin::Fresh)
    }

    async fn complete(&self, key: &str, result: serde_json::Value) -> AppResult<()> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(key) {
            if record.result.is_none() {
                record.result = Some(result);
            }
        }
        Ok(())
    }

    async fn abandon(&self, key: &str) -> AppResult<()> {
        let mut records = self.records.lock();
        if let Some(record) = records.get(key) {
            // never drop a stored outcome
            if record.result.is_none() {
                records.remove(key);
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryIdempotencyStore {
        MemoryIdempotencyStore::new(
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn fresh_then_duplicate_with_stored_result() {
        let store = store();
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);

        // second worker racing on the same key sees an in-flight duplicate
        assert_eq!(
            store.begin("k1", "fp1").await.unwrap(),
            Begin::Duplicate(None)
        );

        store.complete("k1", json!({"status": "succeeded"})).await.unwrap();
        assert_eq!(
            store.begin("k1", "fp1").await.unwrap(),
            Begin::Duplicate(Some(json!({"status": "succeeded"})))
        );
    }

    #[tokio::test]
    async fn same_key_different_fingerprint_conflicts() {
        let store = store();
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);
        assert_eq!(store.begin("k1", "fp2").await.unwrap(), Begin::Conflict);
    }

    #[tokio::test]
    async fn different_key_same_fingerprint_dedupes_within_window() {
        let store = store();
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);
        assert_eq!(
            store.begin("k2", "fp1").await.unwrap(),
            Begin::Duplicate(None)
        );
    }

    #[tokio::test]
    async fn fingerprint_older_than_the_window_is_fresh() {
        // zero-width window: the twin created "now" already sits outside it
        let store = MemoryIdempotencyStore::new(
            Duration::from_secs(3600),
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);
        assert_eq!(store.begin("k2", "fp1").await.unwrap(), Begin::Fresh);
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimed_after_the_claim_ttl() {
        // zero claim TTL: a result-less claim is immediately reclaimable,
        // standing in for a worker that died hours ago
        let store = MemoryIdempotencyStore::new(
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Duration::ZERO,
        );
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);

        // a stored outcome is never treated as stale
        store.complete("k1", json!("done")).await.unwrap();
        assert_eq!(
            store.begin("k1", "fp1").await.unwrap(),
            Begin::Duplicate(Some(json!("done")))
        );
    }

    #[tokio::test]
    async fn abandon_frees_the_key_but_not_a_stored_result() {
        let store = store();
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);
        store.abandon("k1").await.unwrap();
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);

        store.complete("k1", json!(1)).await.unwrap();
        store.abandon("k1").await.unwrap();
        assert_eq!(
            store.begin("k1", "fp1").await.unwrap(),
            Begin::Duplicate(Some(json!(1)))
        );
    }

    #[tokio::test]
    async fn first_result_wins() {
        let store = store();
        store.begin("k1", "fp1").await.unwrap();
        store.complete("k1", json!("first")).await.unwrap();
        store.complete("k1", json!("second")).await.unwrap();
        assert_eq!(
            store.begin("k1", "fp1").await.unwrap(),
            Begin::Duplicate(Some(json!("first")))
        );
    }

    #[tokio::test]
    async fn purge_removes_expired_keys() {
        let store = MemoryIdempotencyStore::new(
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        store.begin("k1", "fp1").await.unwrap();
        let purged = store.purge_expired(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.begin("k1", "fp1").await.unwrap(), Begin::Fresh);
    }
}
