use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outpost_core::{ClaimToken, EventId};
use outpost_events::{NewOutboxEvent, OutboxEvent, OutboxStatus, PublishedEvent};

use super::store::{ClaimRequest, OutboxStats, OutboxStore, OutboxStoreError};

#[derive(Debug, Default)]
struct State {
    events: HashMap<EventId, OutboxEvent>,
    receipts: HashMap<EventId, PublishedEvent>,
}

/// In-memory outbox.
///
/// Intended for tests/dev. A single lock stands in for the database: a claim
/// is a conditional update under the write lock, so concurrent claimers never
/// see the same row.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    state: RwLock<State>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Append a PENDING row.
    ///
    /// Callers that also mutate business state must hold their own lock across
    /// the mutation and this call, so both land or neither does.
    pub fn enqueue(
        &self,
        event: NewOutboxEvent,
        created_at: DateTime<Utc>,
    ) -> Result<OutboxEvent, OutboxStoreError> {
        let row = event.into_event(created_at);
        let mut state = self.write()?;
        state.events.insert(row.id, row.clone());
        Ok(row)
    }

    /// Every row, oldest first.
    pub fn all(&self) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;
        let mut rows: Vec<_> = state.events.values().cloned().collect();
        rows.sort_by_key(|e| (e.created_at, e.id));
        Ok(rows)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, OutboxStoreError> {
        self.state
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))
    }

    fn read_with<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T, OutboxStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))?;
        Ok(f(&state))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_due(&self, request: ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut state = self.write()?;

        let mut due: Vec<_> = state
            .events
            .values()
            .filter(|e| e.is_claimable(request.now))
            .map(|e| (e.created_at, e.id))
            .collect();
        due.sort();
        due.truncate(request.limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(event) = state.events.get_mut(&id) {
                event.claim(request.token, request.lease_until);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn extend_claim(
        &self,
        event_id: EventId,
        token: ClaimToken,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut state = self.write()?;

        let event = state
            .events
            .get_mut(&event_id)
            .ok_or(OutboxStoreError::NotFound(event_id))?;
        if !event.holds_live_claim(token, now) {
            return Err(OutboxStoreError::ClaimLost(event_id));
        }
        event.claimed_until = Some(until);
        Ok(())
    }

    async fn mark_processed(
        &self,
        event_id: EventId,
        token: ClaimToken,
        topic: &str,
        published_at: DateTime<Utc>,
    ) -> Result<PublishedEvent, OutboxStoreError> {
        let mut state = self.write()?;

        let event = state
            .events
            .get_mut(&event_id)
            .ok_or(OutboxStoreError::NotFound(event_id))?;
        if !event.is_claimed_by(token) || event.status != OutboxStatus::Pending {
            return Err(OutboxStoreError::ClaimLost(event_id));
        }
        event.record_success(published_at);

        let receipt = state
            .receipts
            .entry(event_id)
            .or_insert_with(|| PublishedEvent {
                source_event_id: event_id,
                topic: topic.to_string(),
                published_at,
            })
            .clone();
        Ok(receipt)
    }

    async fn mark_failed(&self, event: &OutboxEvent, token: ClaimToken) -> Result<(), OutboxStoreError> {
        let mut state = self.write()?;

        let stored = state
            .events
            .get_mut(&event.id)
            .ok_or(OutboxStoreError::NotFound(event.id))?;
        if !stored.is_claimed_by(token) || stored.status != OutboxStatus::Pending {
            return Err(OutboxStoreError::ClaimLost(event.id));
        }

        stored.attempt_count = event.attempt_count;
        stored.last_error = event.last_error.clone();
        stored.next_attempt_at = event.next_attempt_at;
        stored.status = event.status;
        stored.dead_letter = event.dead_letter;
        stored.claimed_by = None;
        stored.claimed_until = None;
        Ok(())
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        self.read_with(|s| s.events.get(&event_id).cloned())
    }

    async fn receipt(&self, event_id: EventId) -> Result<Option<PublishedEvent>, OutboxStoreError> {
        self.read_with(|s| s.receipts.get(&event_id).cloned())
    }

    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxStoreError> {
        let mut state = self.write()?;

        let mut doomed: Vec<_> = state
            .events
            .values()
            .filter(|e| e.status.is_terminal() && e.created_at < cutoff)
            .map(|e| (e.created_at, e.id))
            .collect();
        doomed.sort();
        doomed.truncate(limit);

        for (_, id) in &doomed {
            state.events.remove(id);
            state.receipts.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.read_with(|s| {
            let mut stats = OutboxStats::default();
            for event in s.events.values() {
                match event.status {
                    OutboxStatus::Pending => {
                        stats.pending += 1;
                        stats.oldest_pending_at = Some(match stats.oldest_pending_at {
                            Some(oldest) => oldest.min(event.created_at),
                            None => event.created_at,
                        });
                    }
                    OutboxStatus::Processed => stats.processed += 1,
                    OutboxStatus::Dead => stats.dead += 1,
                }
            }
            stats
        })
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        self.read_with(|s| {
            let mut dead: Vec<_> = s
                .events
                .values()
                .filter(|e| e.status == OutboxStatus::Dead)
                .cloned()
                .collect();
            dead.sort_by_key(|e| (e.created_at, e.id));
            dead.truncate(limit);
            dead
        })
    }

    async fn requeue_dead_letter(&self, event_id: EventId) -> Result<OutboxEvent, OutboxStoreError> {
        let mut state = self.write()?;

        let event = state
            .events
            .get_mut(&event_id)
            .ok_or(OutboxStoreError::NotFound(event_id))?;
        event
            .requeue()
            .map_err(|e| OutboxStoreError::Conflict(e.to_string()))?;
        Ok(event.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use outpost_events::RetryPolicy;
    use serde_json::json;

    fn request(now: DateTime<Utc>, limit: usize) -> ClaimRequest {
        ClaimRequest {
            token: ClaimToken::new(),
            limit,
            now,
            lease_until: now + Duration::minutes(5),
        }
    }

    fn new_event(n: u32) -> NewOutboxEvent {
        NewOutboxEvent::new("order", format!("o-{n}"), "order.placed", json!({ "n": n }))
    }

    #[tokio::test]
    async fn claims_oldest_first_up_to_limit() {
        let store = InMemoryOutboxStore::new();
        let t0 = Utc::now();
        let third = store.enqueue(new_event(3), t0 + Duration::seconds(2)).unwrap();
        let first = store.enqueue(new_event(1), t0).unwrap();
        let second = store.enqueue(new_event(2), t0 + Duration::seconds(1)).unwrap();

        let claimed = store.claim_due(request(t0 + Duration::seconds(5), 2)).await.unwrap();

        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        let rest = store.claim_due(request(t0 + Duration::seconds(5), 10)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, third.id);
    }

    #[tokio::test]
    async fn claimed_rows_are_skipped_until_the_lease_lapses() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        store.enqueue(new_event(1), now).unwrap();

        let first = request(now, 10);
        assert_eq!(store.claim_due(first).await.unwrap().len(), 1);
        assert!(store.claim_due(request(now, 10)).await.unwrap().is_empty());

        let after_lease = request(first.lease_until, 10);
        assert_eq!(store.claim_due(after_lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lapsed_lease_cannot_be_extended() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let event = store.enqueue(new_event(1), now).unwrap();
        let claim = request(now, 10);
        store.claim_due(claim).await.unwrap();

        let later = claim.lease_until + Duration::minutes(5);
        store
            .extend_claim(event.id, claim.token, now, later)
            .await
            .unwrap();
        // Extended, so still hidden at the old expiry.
        assert!(store.claim_due(request(claim.lease_until, 10)).await.unwrap().is_empty());

        assert!(matches!(
            store.extend_claim(event.id, claim.token, later, later + Duration::minutes(5)).await,
            Err(OutboxStoreError::ClaimLost(_))
        ));
        assert!(matches!(
            store.extend_claim(event.id, ClaimToken::new(), now, later).await,
            Err(OutboxStoreError::ClaimLost(_))
        ));
    }

    #[tokio::test]
    async fn processed_rows_get_exactly_one_receipt() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let event = store.enqueue(new_event(1), now).unwrap();
        let claim = request(now, 10);
        store.claim_due(claim).await.unwrap();

        let receipt = store
            .mark_processed(event.id, claim.token, "events.orders", now)
            .await
            .unwrap();
        assert_eq!(receipt.topic, "events.orders");

        // A second completion is rejected and leaves the receipt untouched.
        let again = store.mark_processed(event.id, claim.token, "other", now).await;
        assert!(matches!(again, Err(OutboxStoreError::ClaimLost(_))));
        assert_eq!(store.receipt(event.id).await.unwrap(), Some(receipt));

        let stored = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert_eq!(stored.processed_at, Some(now));
    }

    #[tokio::test]
    async fn stale_claimer_cannot_overwrite_a_new_claim() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let event = store.enqueue(new_event(1), now).unwrap();

        let stale = request(now, 10);
        store.claim_due(stale).await.unwrap();
        let fresh = request(stale.lease_until, 10);
        store.claim_due(fresh).await.unwrap();

        let mut failed = event.clone();
        failed.record_failure("late", &RetryPolicy::default(), now);
        assert!(matches!(
            store.mark_failed(&failed, stale.token).await,
            Err(OutboxStoreError::ClaimLost(_))
        ));
        store.mark_failed(&failed, fresh.token).await.unwrap();

        let stored = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn terminal_deletes_are_batched_and_skip_pending() {
        let store = InMemoryOutboxStore::new();
        let old = Utc::now() - Duration::days(40);
        let pending = store.enqueue(new_event(0), old).unwrap();
        for n in 1..=3 {
            let event = store.enqueue(new_event(n), old).unwrap();
            let claim = request(old, 10);
            store.claim_due(claim).await.unwrap();
            store.mark_processed(event.id, claim.token, "t", old).await.unwrap();
        }

        let cutoff = Utc::now() - Duration::days(30);
        assert_eq!(store.delete_terminal_before(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.delete_terminal_before(cutoff, 2).await.unwrap(), 1);
        assert_eq!(store.delete_terminal_before(cutoff, 2).await.unwrap(), 0);

        assert!(store.get(pending.id).await.unwrap().is_some());
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn dead_letters_can_be_listed_and_requeued() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let event = store.enqueue(new_event(1), now).unwrap();
        let claim = request(now, 10);
        let mut claimed = store.claim_due(claim).await.unwrap().remove(0);
        claimed.record_failure("boom", &RetryPolicy::default().with_max_attempts(1), now);
        store.mark_failed(&claimed, claim.token).await.unwrap();

        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].dead_letter);
        assert_eq!(store.stats().await.unwrap().dead, 1);

        let requeued = store.requeue_dead_letter(event.id).await.unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(store.claim_due(request(now, 10)).await.unwrap().len(), 1);

        assert!(matches!(
            store.requeue_dead_letter(event.id).await,
            Err(OutboxStoreError::Conflict(_))
        ));
    }
}
