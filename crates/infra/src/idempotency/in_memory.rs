use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{IdempotencyStore, IdempotencyStoreError};
use super::types::{Begin, IdempotencyKey, IdempotencyRecord, IdempotencyScope};

type RecordKey = (IdempotencyScope, IdempotencyKey);

/// In-memory idempotency store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<RecordKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a record as-is (seeding old or crashed attempts in tests).
    pub fn insert(&self, record: IdempotencyRecord) -> Result<(), IdempotencyStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert((record.scope, record.key.clone()), record);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, IdempotencyStoreError> {
        Ok(self.records.read().map_err(|_| poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool, IdempotencyStoreError> {
        Ok(self.len()? == 0)
    }
}

fn poisoned() -> IdempotencyStoreError {
    IdempotencyStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Begin, IdempotencyStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;

        match records.get_mut(&(scope, key.clone())) {
            None => {
                records.insert(
                    (scope, key.clone()),
                    IdempotencyRecord::started(scope, key.clone(), now),
                );
                Ok(Begin::Acquired)
            }
            Some(record) => {
                if let Some(result) = record.completed_result() {
                    Ok(Begin::Completed(result))
                } else if record.is_stale(stale_before) {
                    record.updated_at = now;
                    Ok(Begin::Acquired)
                } else {
                    Ok(Begin::InFlight)
                }
            }
        }
    }

    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        result_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let record = records
            .get_mut(&(scope, key.clone()))
            .ok_or_else(|| IdempotencyStoreError::NotFound {
                scope,
                key: key.clone(),
            })?;
        record.success = true;
        record.result_id = Some(result_id);
        record.updated_at = now;
        Ok(())
    }

    async fn abandon(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<(), IdempotencyStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let id = (scope, key.clone());
        if records.get(&id).is_some_and(|r| !r.success) {
            records.remove(&id);
        }
        Ok(())
    }

    async fn get(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&(scope, key.clone())).cloned())
    }

    async fn delete_expired_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, IdempotencyStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;

        let mut doomed: Vec<_> = records
            .iter()
            .filter(|(_, r)| r.is_expired(cutoff))
            .map(|(id, r)| (r.created_at, id.clone()))
            .collect();
        doomed.sort_by_key(|(created_at, _)| *created_at);
        doomed.truncate(limit);

        for (_, id) in &doomed {
            records.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
