use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{Begin, IdempotencyKey, IdempotencyRecord, IdempotencyScope};

/// Idempotency store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyStoreError {
    #[error("idempotency record not found: {scope}/{key}")]
    NotFound {
        scope: IdempotencyScope,
        key: IdempotencyKey,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable idempotency records, at most one per `(scope, key)`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Try to take ownership of a key.
    ///
    /// - no record: insert one (`success = false`) and return `Acquired`; losing
    ///   the insert race returns `InFlight`
    /// - successful record: `Completed(result)`
    /// - unfinished record touched at or before `stale_before`: take it over
    ///   (refresh `updated_at`) and return `Acquired`
    /// - unfinished and fresh: `InFlight`
    async fn begin(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Begin, IdempotencyStoreError>;

    /// Flip the record to successful and link the result.
    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        result_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError>;

    /// Drop an unfinished record after the operation failed, freeing the key.
    async fn abandon(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<(), IdempotencyStoreError>;

    async fn get(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;

    /// Delete up to `limit` successful, linked records created before
    /// `cutoff`. Returns the number deleted.
    async fn delete_expired_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, IdempotencyStoreError>;
}

#[async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn begin(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Begin, IdempotencyStoreError> {
        (**self).begin(scope, key, now, stale_before).await
    }

    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        result_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        (**self).complete(scope, key, result_id, now).await
    }

    async fn abandon(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<(), IdempotencyStoreError> {
        (**self).abandon(scope, key).await
    }

    async fn get(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        (**self).get(scope, key).await
    }

    async fn delete_expired_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, IdempotencyStoreError> {
        (**self).delete_expired_before(cutoff, limit).await
    }
}
