use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{BreakerRecord, BreakerStore};
use crate::error::AppResult;

/// In-memory breaker state for tests.
#[derive(Default)]
pub struct MemoryBreakerStore {
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn load(&self, key: &str) -> AppResult<Option<BreakerRecord>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn save(&self, record: &BreakerRecord) -> AppResult<()> {
        self.records
            .lock()
            .insert(record.key.clone(), record.clone());
        Ok(())
    }
}
