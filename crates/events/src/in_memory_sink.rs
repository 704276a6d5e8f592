//! In-memory sink for tests/dev.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use outpost_core::EventId;

use crate::envelope::PublishEnvelope;
use crate::sink::{Sink, SinkError};

#[derive(Debug, Default)]
struct State {
    delivered: Vec<PublishEnvelope>,
    failing_event_types: HashSet<String>,
    remaining_failures: u32,
    fail_all: bool,
}

/// Records every accepted envelope.
///
/// - No IO
/// - Failures can be scripted per event type, for the next N calls, or for
///   every call, to drive retry and dead-letter paths
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: Mutex<State>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every event of `event_type` until cleared.
    pub fn fail_event_type(&self, event_type: impl Into<String>) {
        self.with_state(|s| {
            s.failing_event_types.insert(event_type.into());
        });
    }

    /// Reject the next `n` publish calls, whatever they carry.
    pub fn fail_next(&self, n: u32) {
        self.with_state(|s| s.remaining_failures = n);
    }

    /// Reject every publish call until [`InMemorySink::recover`].
    pub fn fail_all(&self) {
        self.with_state(|s| s.fail_all = true);
    }

    /// Clear all scripted failures.
    pub fn recover(&self) {
        self.with_state(|s| {
            s.failing_event_types.clear();
            s.remaining_failures = 0;
            s.fail_all = false;
        });
    }

    pub fn delivered(&self) -> Vec<PublishEnvelope> {
        self.with_state(|s| s.delivered.clone())
    }

    pub fn delivered_ids(&self) -> Vec<EventId> {
        self.with_state(|s| s.delivered.iter().map(|e| e.event_id()).collect())
    }

    pub fn delivery_count(&self) -> usize {
        self.with_state(|s| s.delivered.len())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        // A poisoned lock only means another test thread panicked mid-publish;
        // the recorded deliveries are still meaningful.
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<(), SinkError> {
        self.with_state(|s| {
            if s.fail_all {
                return Err(SinkError::Unavailable("sink is down".to_string()));
            }
            if s.remaining_failures > 0 {
                s.remaining_failures -= 1;
                return Err(SinkError::Unavailable("scripted failure".to_string()));
            }
            if s.failing_event_types.contains(envelope.event_type()) {
                return Err(SinkError::Rejected(format!(
                    "event type '{}' is rejected",
                    envelope.event_type()
                )));
            }
            s.delivered.push(envelope.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::event::DomainEvent;
    use crate::outbox::NewOutboxEvent;

    fn envelope(event_type: &str) -> PublishEnvelope {
        let source = NewOutboxEvent::new("cart", "c-1", event_type, json!({})).into_event(Utc::now());
        let event = DomainEvent::decode(&source.event_type, &source.payload).unwrap();
        PublishEnvelope::new(&source, "events.default", event)
    }

    #[tokio::test]
    async fn records_accepted_envelopes() {
        let sink = InMemorySink::new();
        let env = envelope("cart.updated");

        sink.publish(&env).await.unwrap();

        assert_eq!(sink.delivered_ids(), vec![env.event_id()]);
        assert_eq!(sink.delivered()[0].attempt(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let sink = InMemorySink::new();
        sink.fail_next(2);

        assert!(sink.publish(&envelope("cart.updated")).await.is_err());
        assert!(sink.publish(&envelope("cart.updated")).await.is_err());
        assert!(sink.publish(&envelope("cart.updated")).await.is_ok());
        assert_eq!(sink.delivery_count(), 1);
    }

    #[tokio::test]
    async fn failing_event_type_only_affects_that_type() {
        let sink = InMemorySink::new();
        sink.fail_event_type("cart.abandoned");

        assert!(matches!(
            sink.publish(&envelope("cart.abandoned")).await,
            Err(SinkError::Rejected(_))
        ));
        assert!(sink.publish(&envelope("cart.updated")).await.is_ok());

        sink.recover();
        assert!(sink.publish(&envelope("cart.abandoned")).await.is_ok());
    }
}
