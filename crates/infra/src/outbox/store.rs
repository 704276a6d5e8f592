//! Outbox storage abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use outpost_core::{ClaimToken, EventId};
use outpost_events::{OutboxEvent, PublishedEvent};

/// Parameters of one claim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Stamped on every claimed row; later writes must present it.
    pub token: ClaimToken,
    pub limit: usize,
    pub now: DateTime<Utc>,
    /// Claims lapse at this instant if the claimer never reports back.
    pub lease_until: DateTime<Utc>,
}

/// Counts per status, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processed: u64,
    pub dead: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox event not found: {0}")]
    NotFound(EventId),

    /// The row is no longer claimed by the caller (lease lapsed and another
    /// worker took it, or it already left PENDING).
    #[error("claim on outbox event {0} was lost")]
    ClaimLost(EventId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable outbox.
///
/// Rows are written by business transactions (see `PgOutboxWriter` and
/// `InMemoryOutboxStore::enqueue`); this trait covers everything that happens
/// to them afterwards.
///
/// Implementations must guarantee:
/// - `claim_due` never hands the same row to two live claims
/// - `claim_due` returns rows oldest `created_at` first
/// - `extend_claim` only renews a lease that `token` holds and that has not lapsed
/// - `mark_processed` and `mark_failed` only apply while `token` still owns the row
/// - receipts are created at most once per event
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due PENDING rows, skipping rows claimed by others.
    async fn claim_due(&self, request: ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Push the lease of a row claimed by `token` out to `until`. Fails with
    /// `ClaimLost` if the lease had already lapsed at `now` or the row changed
    /// hands.
    async fn extend_claim(
        &self,
        event_id: EventId,
        token: ClaimToken,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Mark a claimed row PROCESSED and get-or-create its receipt.
    async fn mark_processed(
        &self,
        event_id: EventId,
        token: ClaimToken,
        topic: &str,
        published_at: DateTime<Utc>,
    ) -> Result<PublishedEvent, OutboxStoreError>;

    /// Persist a failed attempt (`event` already carries the new attempt count,
    /// error, schedule and status).
    async fn mark_failed(&self, event: &OutboxEvent, token: ClaimToken) -> Result<(), OutboxStoreError>;

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    async fn receipt(&self, event_id: EventId) -> Result<Option<PublishedEvent>, OutboxStoreError>;

    /// Delete up to `limit` PROCESSED/DEAD rows created before `cutoff`,
    /// together with their receipts. Returns the number of rows deleted.
    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;

    /// Dead-lettered rows, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Put a DEAD row back into the pool with a fresh retry budget.
    async fn requeue_dead_letter(&self, event_id: EventId) -> Result<OutboxEvent, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn claim_due(&self, request: ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).claim_due(request).await
    }

    async fn extend_claim(
        &self,
        event_id: EventId,
        token: ClaimToken,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).extend_claim(event_id, token, now, until).await
    }

    async fn mark_processed(
        &self,
        event_id: EventId,
        token: ClaimToken,
        topic: &str,
        published_at: DateTime<Utc>,
    ) -> Result<PublishedEvent, OutboxStoreError> {
        (**self).mark_processed(event_id, token, topic, published_at).await
    }

    async fn mark_failed(&self, event: &OutboxEvent, token: ClaimToken) -> Result<(), OutboxStoreError> {
        (**self).mark_failed(event, token).await
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        (**self).get(event_id).await
    }

    async fn receipt(&self, event_id: EventId) -> Result<Option<PublishedEvent>, OutboxStoreError> {
        (**self).receipt(event_id).await
    }

    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxStoreError> {
        (**self).delete_terminal_before(cutoff, limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        (**self).list_dead_letters(limit).await
    }

    async fn requeue_dead_letter(&self, event_id: EventId) -> Result<OutboxEvent, OutboxStoreError> {
        (**self).requeue_dead_letter(event_id).await
    }
}
