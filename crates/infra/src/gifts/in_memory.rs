use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outpost_core::GiftId;
use outpost_events::NewOutboxEvent;
use outpost_gifts::{ActivationAttempt, Gift};

use super::store::{ActivationLog, GiftStore, GiftStoreError, activation_error};
use crate::outbox::InMemoryOutboxStore;

/// In-memory gifts sharing an [`InMemoryOutboxStore`].
///
/// The gift lock is held across the gift write and the outbox append, which
/// gives the same all-or-nothing outcome as a database transaction.
#[derive(Debug)]
pub struct InMemoryGiftStore {
    gifts: Mutex<Gifts>,
    outbox: Arc<InMemoryOutboxStore>,
}

#[derive(Debug, Default)]
struct Gifts {
    rows: HashMap<GiftId, Gift>,
    by_creation_key: HashMap<String, GiftId>,
}

impl InMemoryGiftStore {
    pub fn new(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            gifts: Mutex::new(Gifts::default()),
            outbox,
        }
    }

    pub fn count(&self) -> Result<usize, GiftStoreError> {
        Ok(self.lock()?.rows.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Gifts>, GiftStoreError> {
        self.gifts
            .lock()
            .map_err(|_| GiftStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl GiftStore for InMemoryGiftStore {
    async fn insert(
        &self,
        gift: &Gift,
        creation_key: Option<&str>,
        event: NewOutboxEvent,
    ) -> Result<GiftId, GiftStoreError> {
        let mut gifts = self.lock()?;
        if let Some(existing) = creation_key.and_then(|k| gifts.by_creation_key.get(k)) {
            return Ok(*existing);
        }
        if gifts.rows.contains_key(&gift.id) {
            return Err(GiftStoreError::Duplicate(gift.id));
        }
        if gifts.rows.values().any(|g| g.activation_token == gift.activation_token) {
            return Err(GiftStoreError::Storage("activation token collision".to_string()));
        }

        self.outbox.enqueue(event, gift.created_at)?;
        gifts.rows.insert(gift.id, gift.clone());
        if let Some(key) = creation_key {
            gifts.by_creation_key.insert(key.to_string(), gift.id);
        }
        Ok(gift.id)
    }

    async fn get(&self, id: GiftId) -> Result<Option<Gift>, GiftStoreError> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    async fn find_by_creation_key(&self, key: &str) -> Result<Option<Gift>, GiftStoreError> {
        let gifts = self.lock()?;
        Ok(gifts
            .by_creation_key
            .get(key)
            .and_then(|id| gifts.rows.get(id))
            .cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Gift>, GiftStoreError> {
        Ok(self
            .lock()?
            .rows
            .values()
            .find(|g| g.activation_token == token)
            .cloned())
    }

    async fn activate(&self, id: GiftId, now: DateTime<Utc>) -> Result<Gift, GiftStoreError> {
        let mut gifts = self.lock()?;
        let stored = gifts.rows.get(&id).ok_or(GiftStoreError::NotFound(id))?;

        let mut gift = stored.clone();
        gift.activate(now).map_err(|e| activation_error(id, e))?;
        let event = gift
            .activated_event()
            .ok_or_else(|| GiftStoreError::Storage(format!("gift {id} has no activation time")))?;

        self.outbox.enqueue(NewOutboxEvent::from_domain(&event)?, now)?;
        gifts.rows.insert(id, gift.clone());
        Ok(gift)
    }
}

/// In-memory activation audit log.
#[derive(Debug, Default)]
pub struct InMemoryActivationLog {
    attempts: Mutex<Vec<ActivationAttempt>>,
    unavailable: bool,
}

impl InMemoryActivationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log whose writes always fail.
    pub fn unavailable() -> Self {
        Self {
            attempts: Mutex::new(Vec::new()),
            unavailable: true,
        }
    }

    pub fn attempts(&self) -> Vec<ActivationAttempt> {
        self.attempts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActivationLog for InMemoryActivationLog {
    async fn append(&self, attempt: &ActivationAttempt) -> Result<(), GiftStoreError> {
        if self.unavailable {
            return Err(GiftStoreError::Storage("audit log unavailable".to_string()));
        }
        self.attempts
            .lock()
            .map_err(|_| GiftStoreError::Storage("lock poisoned".to_string()))?
            .push(attempt.clone());
        Ok(())
    }
}
