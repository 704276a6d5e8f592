//! Gift persistence and the activation audit trail.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outpost_core::{DomainError, GiftId};
use outpost_events::{NewOutboxEvent, PayloadError};
use outpost_gifts::{ActivationAttempt, Gift};

use crate::outbox::OutboxStoreError;

#[derive(Debug, thiserror::Error)]
pub enum GiftStoreError {
    #[error("gift not found: {0}")]
    NotFound(GiftId),

    #[error("gift {0} is already activated")]
    AlreadyActivated(GiftId),

    #[error("gift {0} has expired")]
    Expired(GiftId),

    #[error("gift {0} already exists")]
    Duplicate(GiftId),

    #[error("event payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("outbox: {0}")]
    Outbox(#[from] OutboxStoreError),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Map a refused `Gift::activate` transition to the store error.
pub(crate) fn activation_error(id: GiftId, err: DomainError) -> GiftStoreError {
    match err {
        DomainError::Conflict(_) => GiftStoreError::AlreadyActivated(id),
        DomainError::InvariantViolation(_) => GiftStoreError::Expired(id),
        other => GiftStoreError::Storage(other.to_string()),
    }
}

/// Gift rows. Every mutation writes its outbox event atomically with it.
#[async_trait]
pub trait GiftStore: Send + Sync {
    /// Insert a new gift together with its `gift.created` event.
    ///
    /// `creation_key` is unique across gifts. When another gift already holds
    /// it, nothing is written and that gift's id is returned instead of
    /// `gift.id`.
    async fn insert(
        &self,
        gift: &Gift,
        creation_key: Option<&str>,
        event: NewOutboxEvent,
    ) -> Result<GiftId, GiftStoreError>;

    async fn get(&self, id: GiftId) -> Result<Option<Gift>, GiftStoreError>;

    async fn find_by_creation_key(&self, key: &str) -> Result<Option<Gift>, GiftStoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Gift>, GiftStoreError>;

    /// Activate a gift and enqueue its `gift.activated` event in one step.
    ///
    /// Fails with `AlreadyActivated` / `Expired` without writing anything.
    async fn activate(&self, id: GiftId, now: DateTime<Utc>) -> Result<Gift, GiftStoreError>;
}

/// Append-only log of activation attempts.
#[async_trait]
pub trait ActivationLog: Send + Sync {
    async fn append(&self, attempt: &ActivationAttempt) -> Result<(), GiftStoreError>;
}

#[async_trait]
impl<S> GiftStore for Arc<S>
where
    S: GiftStore + ?Sized,
{
    async fn insert(
        &self,
        gift: &Gift,
        creation_key: Option<&str>,
        event: NewOutboxEvent,
    ) -> Result<GiftId, GiftStoreError> {
        (**self).insert(gift, creation_key, event).await
    }

    async fn get(&self, id: GiftId) -> Result<Option<Gift>, GiftStoreError> {
        (**self).get(id).await
    }

    async fn find_by_creation_key(&self, key: &str) -> Result<Option<Gift>, GiftStoreError> {
        (**self).find_by_creation_key(key).await
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Gift>, GiftStoreError> {
        (**self).find_by_token(token).await
    }

    async fn activate(&self, id: GiftId, now: DateTime<Utc>) -> Result<Gift, GiftStoreError> {
        (**self).activate(id, now).await
    }
}

#[async_trait]
impl<L> ActivationLog for Arc<L>
where
    L: ActivationLog + ?Sized,
{
    async fn append(&self, attempt: &ActivationAttempt) -> Result<(), GiftStoreError> {
        (**self).append(attempt).await
    }
}
