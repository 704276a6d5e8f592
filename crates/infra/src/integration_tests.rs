//! Pipeline tests across the stores, the dispatcher, the guard and the sweeper.
//!
//! Business write → outbox row → claim → sink → receipt, plus the guarded gift
//! operations and retention, all against the in-memory stores.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;

    use outpost_core::{Clock, ManualClock};
    use outpost_events::{
        DomainEvent, InMemorySink, NewOutboxEvent, OutboxEvent, OutboxStatus, Sink,
    };
    use outpost_gifts::{ActivationOutcome, CreateGiftRequest};

    use crate::dispatcher::{DispatcherConfig, OutboxDispatcher};
    use crate::gifts::{GiftService, InMemoryActivationLog, InMemoryGiftStore};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::outbox::{InMemoryOutboxStore, OutboxStore};
    use crate::sinks::LogSink;
    use crate::sweeper::CleanupSweeper;

    type Gifts = GiftService<
        Arc<InMemoryGiftStore>,
        Arc<InMemoryIdempotencyStore>,
        Arc<InMemoryActivationLog>,
    >;

    fn order_placed(n: usize) -> NewOutboxEvent {
        NewOutboxEvent::new(
            "order",
            format!("ord-{n}"),
            "order.placed",
            json!({ "order_id": format!("ord-{n}"), "total_minor": 1000 + n, "currency": "EUR" }),
        )
    }

    fn forced_failure() -> NewOutboxEvent {
        NewOutboxEvent::new(
            "order",
            "ord-x",
            "order.placed",
            json!({ "order_id": "ord-x", "total_minor": 1, "currency": "EUR", "force_fail": true }),
        )
    }

    fn gift_request() -> CreateGiftRequest {
        CreateGiftRequest {
            purchaser_ref: "customer-3".to_string(),
            recipient_email: "grace@example.com".to_string(),
            amount_minor: 10_000,
            currency: "USD".to_string(),
            message: None,
            valid_for_days: 90,
        }
    }

    fn gift_service(outbox: Arc<InMemoryOutboxStore>, clock: Arc<ManualClock>) -> Gifts {
        GiftService::new(
            Arc::new(InMemoryGiftStore::new(outbox)),
            InMemoryIdempotencyStore::arc(),
            Arc::new(InMemoryActivationLog::new()),
        )
        .with_clock(clock)
    }

    fn dispatcher<K: Sink>(
        store: Arc<InMemoryOutboxStore>,
        sink: K,
        clock: Arc<ManualClock>,
    ) -> OutboxDispatcher<Arc<InMemoryOutboxStore>, K> {
        OutboxDispatcher::new(store, sink).with_clock(clock)
    }

    fn only_event(store: &InMemoryOutboxStore) -> OutboxEvent {
        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        all.into_iter().next().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatchers_publish_each_event_once() {
        let store = InMemoryOutboxStore::arc();
        let sink = Arc::new(InMemorySink::new());
        let clock = ManualClock::starting_now();

        for n in 0..200 {
            store.enqueue(order_placed(n), clock.now()).unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..4 {
            let d = dispatcher(store.clone(), sink.clone(), clock.clone()).with_config(
                DispatcherConfig::default()
                    .with_batch_size(7)
                    .with_name(format!("worker-{worker}")),
            );
            handles.push(tokio::spawn(async move { d.drain().await.unwrap() }));
        }

        let mut processed = 0;
        for handle in handles {
            processed += handle.await.unwrap().processed;
        }

        let ids = sink.delivered_ids();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(processed, 200);
        assert_eq!(ids.len(), 200);
        assert_eq!(unique.len(), 200);

        for event in store.all().unwrap() {
            assert_eq!(event.status, OutboxStatus::Processed);
            assert!(store.receipt(event.id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn forced_failure_costs_exactly_one_attempt() {
        let store = InMemoryOutboxStore::arc();
        let clock = ManualClock::starting_now();
        store.enqueue(forced_failure(), clock.now()).unwrap();

        let report = dispatcher(store.clone(), LogSink::new(), clock.clone())
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.processed, 0);

        let event = only_event(&store);
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.status, OutboxStatus::Pending);
        assert!(!event.dead_letter);
        assert!(event.last_error.unwrap().contains("forced failure"));
    }

    #[tokio::test]
    async fn tenth_failure_dead_letters_for_good() {
        let store = InMemoryOutboxStore::arc();
        let clock = ManualClock::starting_now();
        store.enqueue(forced_failure(), clock.now()).unwrap();
        let d = dispatcher(store.clone(), LogSink::new(), clock.clone());

        for attempt in 1..=10u32 {
            let report = d.run_once().await.unwrap();
            assert_eq!(report.claimed, 1, "attempt {attempt} should find the event due");
            clock.advance(Duration::minutes(61));
        }

        let event = only_event(&store);
        assert_eq!(event.attempt_count, 10);
        assert_eq!(event.status, OutboxStatus::Dead);
        assert!(event.dead_letter);

        clock.advance(Duration::days(7));
        assert_eq!(d.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn failed_gift_event_is_rescheduled_thirty_seconds_out() {
        let outbox = InMemoryOutboxStore::arc();
        let clock = ManualClock::starting_now();
        let gifts = gift_service(outbox.clone(), clock.clone());
        gifts.create_with_key("checkout-77", gift_request()).await.unwrap();

        let sink = Arc::new(InMemorySink::new());
        sink.fail_event_type(DomainEvent::GIFT_CREATED);
        let d = dispatcher(outbox.clone(), sink.clone(), clock.clone());

        let failed_at = clock.now();
        d.run_once().await.unwrap();

        let event = only_event(&outbox);
        assert_eq!(event.aggregate_type, "gift");
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.next_attempt_at, Some(failed_at + Duration::seconds(30)));

        // Not due yet.
        sink.recover();
        clock.advance(Duration::seconds(29));
        assert_eq!(d.run_once().await.unwrap().claimed, 0);

        clock.advance(Duration::seconds(1));
        let report = d.run_once().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(sink.delivered()[0].topic(), "events.gifts");
        assert_eq!(sink.delivered()[0].attempt(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_activations_apply_once_with_one_answer() {
        let outbox = InMemoryOutboxStore::arc();
        let clock = ManualClock::starting_now();
        let gifts = Arc::new(gift_service(outbox.clone(), clock));
        let token = gifts
            .create_with_key("checkout-1", gift_request())
            .await
            .unwrap()
            .gift
            .activation_token;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let gifts = gifts.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                gifts.activate(&token, None, None).await.unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        let fresh = outcomes
            .iter()
            .filter(|o| matches!(o, ActivationOutcome::Activated(_)))
            .count();
        let replayed = outcomes
            .iter()
            .filter(|o| matches!(o, ActivationOutcome::AlreadyActivated(_)))
            .count();
        assert_eq!((fresh, replayed), (1, 1));
        assert_eq!(outcomes[0].gift(), outcomes[1].gift());

        let activations = outbox
            .all()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == DomainEvent::GIFT_ACTIVATED)
            .count();
        assert_eq!(activations, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_with_one_key_make_one_gift() {
        let outbox = InMemoryOutboxStore::arc();
        let gifts = Arc::new(gift_service(outbox.clone(), ManualClock::starting_now()));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let gifts = gifts.clone();
            handles.push(tokio::spawn(async move {
                gifts.create_with_key("abc", gift_request()).await.unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(outcomes[0].gift.id, outcomes[1].gift.id);
        assert_eq!(outcomes.iter().filter(|o| !o.replayed).count(), 1);
        assert_eq!(gifts.store().count().unwrap(), 1);
        assert_eq!(outbox.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_spares_pending_events_and_open_keys() {
        let outbox = InMemoryOutboxStore::arc();
        let idempotency = InMemoryIdempotencyStore::arc();
        let clock = ManualClock::starting_now();

        store_mixed_outbox(&outbox, &clock).await;

        // Forty days later everything above is past outbox retention.
        clock.advance(Duration::days(40));
        let sweeper = CleanupSweeper::new(outbox.clone(), idempotency.clone())
            .with_clock(clock.clone());
        let report = sweeper.sweep().await;

        assert_eq!(report.outbox_deleted, Some(2));
        let left = outbox.all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, OutboxStatus::Pending);
        assert_eq!(report.idempotency_deleted, Some(0));
    }

    /// One processed, one dead and one still-pending event.
    async fn store_mixed_outbox(outbox: &Arc<InMemoryOutboxStore>, clock: &Arc<ManualClock>) {
        outbox.enqueue(order_placed(1), clock.now()).unwrap();
        dispatcher(outbox.clone(), LogSink::new(), clock.clone())
            .drain()
            .await
            .unwrap();

        clock.advance(Duration::seconds(1));
        outbox.enqueue(forced_failure(), clock.now()).unwrap();
        let d = dispatcher(outbox.clone(), LogSink::new(), clock.clone())
            .with_policy(outpost_events::RetryPolicy::default().with_max_attempts(1));
        d.run_once().await.unwrap();

        clock.advance(Duration::seconds(1));
        let mut pending = forced_failure();
        pending.aggregate_id = "ord-y".to_string();
        outbox.enqueue(pending, clock.now()).unwrap();

        let statuses: Vec<_> = outbox.all().unwrap().iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![OutboxStatus::Processed, OutboxStatus::Dead, OutboxStatus::Pending]
        );
    }
}
