pub mod memory;
pub mod postgres;

pub use memory::MemoryIdempotencyStore;
pub use postgres::PgIdempotencyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::AppResult;

/// Outcome of the atomic check-then-reserve.
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// Caller holds the exclusive right to execute and must later call
    /// `complete` (or `abandon` if the operation was deferred).
    Fresh,
    /// The operation already ran (result stored) or is running right now
    /// (`None`) — callers with `None` defer rather than re-execute.
    Duplicate(Option<serde_json::Value>),
    /// Same key, different inputs. A permanent error.
    Conflict,
}

/// Deduplicates operation attempts by key and, within a configurable window,
/// by content fingerprint. At most one outcome is ever stored per key.
///
/// A claim that never reaches `complete` or `abandon` (crashed worker) stays
/// binding only for the claim TTL; after that `begin` reclaims it, keeping
/// crash recovery on the stuck-job timescale instead of the result TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(&self, key: &str, fingerprint: &str) -> AppResult<Begin>;

    /// Store the outcome for a key claimed via `Fresh`. Idempotent; the first
    /// stored result wins.
    async fn complete(&self, key: &str, result: serde_json::Value) -> AppResult<()>;

    /// Drop a `Fresh` claim whose operation did not reach an outcome (circuit
    /// open, retries exhausted) so a later tick may execute it.
    async fn abandon(&self, key: &str) -> AppResult<()>;

    /// Remove keys past their TTL. Returns the number purged.
    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;
}

/// Content fingerprint over the operation inputs. Two requests with the same
/// fingerprint are the same logical operation regardless of key.
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update([0x1f]); // field separator, prevents ambiguous concatenation
    }
    hex::encode(hasher.finalize())
}
