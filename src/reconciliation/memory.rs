use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::{BalanceCache, CachedBalance};
use crate::error::AppResult;
use crate::ledger::AccountType;

#[derive(Default)]
pub struct MemoryBalanceCache {
    snapshots: Mutex<HashMap<(Uuid, AccountType), CachedBalance>>,
}

impl MemoryBalanceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceCache for MemoryBalanceCache {
    async fn load(
        &self,
        business_id: Uuid,
        account_type: AccountType,
    ) -> AppResult<Option<CachedBalance>> {
        Ok(self
            .snapshots
            .lock()
            .get(&(business_id, account_type))
            .cloned())
    }

    async fn save(&self, snapshot: &CachedBalance) -> AppResult<()> {
        self.snapshots.lock().insert(
            (snapshot.business_id, snapshot.account_type),
            snapshot.clone(),
        );
        Ok(())
    }
}
