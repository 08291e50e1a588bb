//! In-memory suppression store.

use super::{StoreError, SubscriptionRecord, SubscriptionUpdate, SuppressionStore, WriteCondition};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store. Each operation holds the lock for its whole
/// read-modify-write, which gives the single-record atomicity the trait asks for.
#[derive(Debug, Default)]
pub struct InMemorySuppressionStore {
    records: RwLock<HashMap<String, SubscriptionRecord>>,
}

impl InMemorySuppressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SuppressionStore for InMemorySuppressionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, email: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        Ok(self.records.read().await.get(email).cloned())
    }

    async fn exists(&self, email: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(email))
    }

    async fn put_if_absent(&self, record: &SubscriptionRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.email) {
            return Ok(false);
        }
        records.insert(record.email.clone(), record.clone());
        Ok(true)
    }

    async fn merge(
        &self,
        email: &str,
        update: &SubscriptionUpdate,
        condition: WriteCondition,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if condition == WriteCondition::RecordExists && !records.contains_key(email) {
            return Ok(false);
        }
        records
            .entry(email.to_string())
            .or_insert_with(|| SubscriptionRecord::new(email, "", 0))
            .apply(update);
        Ok(true)
    }
}
