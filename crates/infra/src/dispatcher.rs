//! Claim-and-publish loop.
//!
//! One pass claims a batch of due outbox rows and, for each row in creation
//! order, resolves its topic, decodes its payload, publishes it under a timeout
//! and records the outcome. Outcomes are committed per event: a failure on one
//! row never undoes the rows already processed in the same batch.
//!
//! Run as many dispatchers as you like against one store; the store's claim
//! keeps them off each other's rows. The lease is renewed right before each
//! publish, and a row whose lease already lapsed is left alone: by then another
//! dispatcher may own it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use outpost_core::{ClaimToken, SharedClock, SystemClock};
use outpost_events::{
    DomainEvent, FailureDisposition, OutboxEvent, PublishEnvelope, RetryPolicy, Sink, TopicRouter,
};

use crate::outbox::{ClaimRequest, OutboxStore, OutboxStoreError};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(5 * 60);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum rows claimed per pass
    pub batch_size: usize,
    /// Upper bound on a single `Sink::publish` call
    pub publish_timeout: Duration,
    /// How long a claim protects a row from other workers. Never shorter than
    /// twice `publish_timeout`.
    pub claim_lease: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            claim_lease: DEFAULT_CLAIM_LEASE,
            name: "outbox-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// The lease actually stamped on rows: one renewal must outlive a publish.
    pub fn effective_lease(&self) -> Duration {
        self.claim_lease.max(self.publish_timeout.saturating_mul(2))
    }
}

/// Counts for one pass (or a whole drain).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Rows skipped because their lease lapsed before they were published.
    pub lease_lost: usize,
    /// Rows whose outcome could not be recorded (claim lost or store error).
    /// They return to the pool when their lease lapses.
    pub unrecorded: usize,
}

impl DispatchReport {
    fn absorb(&mut self, other: DispatchReport) {
        self.claimed += other.claimed;
        self.processed += other.processed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.lease_lost += other.lease_lost;
        self.unrecorded += other.unrecorded;
    }
}

/// Failure of a whole pass. Per-event failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("claim failed: {0}")]
    Claim(#[source] OutboxStoreError),
}

enum Outcome {
    Processed,
    Retried,
    DeadLettered,
    LeaseLost,
}

/// Outbox dispatcher.
///
/// Polled by the orchestrator (or by an external scheduler through
/// `process-outbox`); owns no background task of its own.
pub struct OutboxDispatcher<S, K> {
    store: S,
    sink: K,
    router: TopicRouter,
    policy: RetryPolicy,
    config: DispatcherConfig,
    clock: SharedClock,
    token: ClaimToken,
}

impl<S, K> OutboxDispatcher<S, K>
where
    S: OutboxStore,
    K: Sink,
{
    pub fn new(store: S, sink: K) -> Self {
        Self {
            store,
            sink,
            router: TopicRouter::default(),
            policy: RetryPolicy::default(),
            config: DispatcherConfig::default(),
            clock: SystemClock::shared(),
            token: ClaimToken::new(),
        }
    }

    pub fn with_router(mut self, router: TopicRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Token stamped on every row this dispatcher claims.
    pub fn claim_token(&self) -> ClaimToken {
        self.token
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One claim-and-publish pass.
    pub async fn run_once(&self) -> Result<DispatchReport, DispatchError> {
        let now = self.clock.now();
        let request = ClaimRequest {
            token: self.token,
            limit: self.config.batch_size,
            now,
            lease_until: self.lease_from(now),
        };

        let claimed = self
            .store
            .claim_due(request)
            .await
            .map_err(DispatchError::Claim)?;

        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..DispatchReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        debug!(dispatcher = %self.config.name, claimed = claimed.len(), "claimed outbox batch");

        for event in claimed {
            let event_id = event.id;
            match self.dispatch(event).await {
                Ok(Outcome::Processed) => report.processed += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::DeadLettered) => report.dead_lettered += 1,
                Ok(Outcome::LeaseLost) => report.lease_lost += 1,
                Err(e) => {
                    report.unrecorded += 1;
                    warn!(
                        dispatcher = %self.config.name,
                        event_id = %event_id,
                        error = %e,
                        "failed to record outbox outcome"
                    );
                }
            }
        }

        info!(
            dispatcher = %self.config.name,
            claimed = report.claimed,
            processed = report.processed,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            lease_lost = report.lease_lost,
            unrecorded = report.unrecorded,
            "outbox pass finished"
        );
        Ok(report)
    }

    /// Run passes until one processes nothing.
    pub async fn drain(&self) -> Result<DispatchReport, DispatchError> {
        let mut total = DispatchReport::default();
        loop {
            let pass = self.run_once().await?;
            total.absorb(pass);
            if pass.processed == 0 {
                return Ok(total);
            }
        }
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.effective_lease())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        now.checked_add_signed(lease).unwrap_or(now)
    }

    async fn dispatch(&self, event: OutboxEvent) -> Result<Outcome, OutboxStoreError> {
        let now = self.clock.now();
        match self
            .store
            .extend_claim(event.id, self.token, now, self.lease_from(now))
            .await
        {
            Ok(()) => {}
            Err(OutboxStoreError::ClaimLost(_)) => {
                debug!(
                    dispatcher = %self.config.name,
                    event_id = %event.id,
                    "lease lapsed before publish, leaving event to its new owner"
                );
                return Ok(Outcome::LeaseLost);
            }
            Err(e) => return Err(e),
        }

        let topic = self.router.resolve(&event.aggregate_type).to_string();

        match self.publish(&event, &topic).await {
            Ok(()) => {
                self.store
                    .mark_processed(event.id, self.token, &topic, self.clock.now())
                    .await?;
                debug!(event_id = %event.id, topic = %topic, "outbox event published");
                Ok(Outcome::Processed)
            }
            Err(reason) => {
                let mut failed = event;
                let disposition = failed.record_failure(&reason, &self.policy, self.clock.now());
                self.store.mark_failed(&failed, self.token).await?;

                match disposition {
                    FailureDisposition::Retry { next_attempt_at } => {
                        warn!(
                            event_id = %failed.id,
                            event_type = %failed.event_type,
                            topic = %topic,
                            attempt = failed.attempt_count,
                            retry_in_secs = (next_attempt_at - self.clock.now()).num_seconds().max(0),
                            error = %reason,
                            "outbox publish failed, retry scheduled"
                        );
                        Ok(Outcome::Retried)
                    }
                    FailureDisposition::DeadLettered => {
                        warn!(
                            event_id = %failed.id,
                            event_type = %failed.event_type,
                            topic = %topic,
                            attempt = failed.attempt_count,
                            error = %reason,
                            "outbox event dead-lettered"
                        );
                        Ok(Outcome::DeadLettered)
                    }
                }
            }
        }
    }

    /// Validate and hand one event to the sink. Any failure comes back as the
    /// message to store in `last_error`.
    async fn publish(&self, event: &OutboxEvent, topic: &str) -> Result<(), String> {
        let decoded = DomainEvent::decode(&event.event_type, &event.payload)
            .map_err(|e| format!("invalid payload: {e}"))?;
        let envelope = PublishEnvelope::new(event, topic, decoded);

        match tokio::time::timeout(self.config.publish_timeout, self.sink.publish(&envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "publish timed out after {}ms",
                self.config.publish_timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use outpost_core::{Clock, ManualClock};
    use outpost_events::{InMemorySink, NewOutboxEvent, OutboxStatus, SinkError};

    use super::*;
    use crate::outbox::InMemoryOutboxStore;

    fn dispatcher(
        store: Arc<InMemoryOutboxStore>,
        sink: Arc<InMemorySink>,
        clock: Arc<ManualClock>,
    ) -> OutboxDispatcher<Arc<InMemoryOutboxStore>, Arc<InMemorySink>> {
        OutboxDispatcher::new(store, sink).with_clock(clock)
    }

    fn order_placed(n: u32) -> NewOutboxEvent {
        NewOutboxEvent::new(
            "order",
            format!("o-{n}"),
            "order.placed",
            json!({ "order_id": format!("o-{n}"), "total_minor": 1200, "currency": "EUR" }),
        )
    }

    #[tokio::test]
    async fn publishes_due_events_in_creation_order() {
        let store = InMemoryOutboxStore::arc();
        let sink = Arc::new(InMemorySink::new());
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        let second = store.enqueue(order_placed(2), t0 + ChronoDuration::seconds(1)).unwrap();
        let first = store.enqueue(order_placed(1), t0).unwrap();
        clock.advance(ChronoDuration::seconds(5));

        let report = dispatcher(store.clone(), sink.clone(), clock).run_once().await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(sink.delivered_ids(), vec![first.id, second.id]);
        assert_eq!(sink.delivered()[0].topic(), "events.orders");

        let receipt = store.receipt(first.id).await.unwrap().unwrap();
        assert_eq!(receipt.topic, "events.orders");
    }

    #[tokio::test]
    async fn failure_in_the_middle_keeps_earlier_successes() {
        let store = InMemoryOutboxStore::arc();
        let sink = Arc::new(InMemorySink::new());
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        let ok = store.enqueue(order_placed(1), t0).unwrap();
        let bad = store
            .enqueue(
                NewOutboxEvent::new("cart", "c-1", "cart.abandoned", json!({})),
                t0 + ChronoDuration::seconds(1),
            )
            .unwrap();
        sink.fail_event_type("cart.abandoned");

        let report = dispatcher(store.clone(), sink, clock).run_once().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(store.get(ok.id).await.unwrap().unwrap().status, OutboxStatus::Processed);

        let failed = store.get(bad.id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Pending);
        assert_eq!(failed.attempt_count, 1);
        assert!(failed.last_error.unwrap().contains("cart.abandoned"));
    }

    #[tokio::test]
    async fn undecodable_payload_counts_as_a_failed_attempt() {
        let store = InMemoryOutboxStore::arc();
        let sink = Arc::new(InMemorySink::new());
        let clock = ManualClock::starting_now();
        let event = store
            .enqueue(
                NewOutboxEvent::new("gift", "g-1", "gift.created", json!({ "amount_minor": "lots" })),
                clock.now(),
            )
            .unwrap();

        let report = dispatcher(store.clone(), sink.clone(), clock).run_once().await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(sink.delivery_count(), 0);
        let stored = store.get(event.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().starts_with("invalid payload"));
    }

    struct StallingSink;

    #[async_trait]
    impl Sink for StallingSink {
        async fn publish(&self, _envelope: &PublishEnvelope) -> Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_sink_calls_time_out_as_failures() {
        let store = InMemoryOutboxStore::arc();
        let clock = ManualClock::starting_now();
        let event = store.enqueue(order_placed(1), clock.now()).unwrap();

        let dispatcher = OutboxDispatcher::new(store.clone(), StallingSink)
            .with_clock(clock)
            .with_config(DispatcherConfig::default().with_publish_timeout(Duration::from_millis(20)));
        let report = dispatcher.run_once().await.unwrap();

        assert_eq!(report.retried, 1);
        let stored = store.get(event.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn drain_stops_when_a_pass_processes_nothing() {
        let store = InMemoryOutboxStore::arc();
        let sink = Arc::new(InMemorySink::new());
        let clock = ManualClock::starting_now();
        for n in 0..7 {
            store.enqueue(order_placed(n), clock.now()).unwrap();
        }

        let dispatcher = dispatcher(store.clone(), sink.clone(), clock)
            .with_config(DispatcherConfig::default().with_batch_size(3));
        let total = dispatcher.drain().await.unwrap();

        assert_eq!(total.processed, 7);
        assert_eq!(sink.delivery_count(), 7);
        assert_eq!(store.stats().await.unwrap().processed, 7);
    }

    #[test]
    fn lease_outlives_one_publish() {
        let config = DispatcherConfig::default().with_claim_lease(Duration::from_secs(1));
        assert_eq!(config.effective_lease(), Duration::from_secs(30));
        assert_eq!(DispatcherConfig::default().effective_lease(), DEFAULT_CLAIM_LEASE);
    }

    /// Two minutes pass per publish. After the third delivery a second
    /// dispatcher runs one pass against the same store.
    struct SlowSink {
        deliveries: Arc<InMemorySink>,
        clock: Arc<ManualClock>,
        rival: OutboxDispatcher<Arc<InMemoryOutboxStore>, Arc<InMemorySink>>,
        rival_report: Mutex<Option<DispatchReport>>,
    }

    #[async_trait]
    impl Sink for SlowSink {
        async fn publish(&self, envelope: &PublishEnvelope) -> Result<(), SinkError> {
            self.deliveries.publish(envelope).await?;
            self.clock.advance(ChronoDuration::minutes(2));
            if self.deliveries.delivery_count() == 3 {
                let report = self
                    .rival
                    .run_once()
                    .await
                    .map_err(|e| SinkError::Unavailable(e.to_string()))?;
                *self.rival_report.lock().unwrap() = Some(report);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn rows_whose_lease_lapsed_mid_batch_are_not_published_twice() {
        let store = InMemoryOutboxStore::arc();
        let deliveries = Arc::new(InMemorySink::new());
        let clock = ManualClock::starting_now();
        for n in 0..5 {
            store.enqueue(order_placed(n), clock.now()).unwrap();
        }

        let sink = Arc::new(SlowSink {
            deliveries: deliveries.clone(),
            clock: clock.clone(),
            rival: dispatcher(store.clone(), deliveries.clone(), clock.clone()),
            rival_report: Mutex::new(None),
        });
        let first = OutboxDispatcher::new(store.clone(), sink.clone()).with_clock(clock.clone());

        let report = first.run_once().await.unwrap();
        let rival = sink.rival_report.lock().unwrap().unwrap();

        assert_eq!((report.claimed, report.processed, report.lease_lost), (5, 3, 2));
        assert_eq!((rival.claimed, rival.processed), (2, 2));

        let ids = deliveries.delivered_ids();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 5);
        assert_eq!(store.stats().await.unwrap().processed, 5);
    }
}
