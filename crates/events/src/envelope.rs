use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use outpost_core::EventId;

use crate::event::DomainEvent;
use crate::outbox::OutboxEvent;

/// What a sink receives for one delivery attempt.
///
/// Notes:
/// - `event_id` is stable across retries; consumers dedupe on it.
/// - `attempt` is 1 for the first delivery (previous failures + 1).
/// - `event` is the validated, typed view of `payload`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishEnvelope {
    event_id: EventId,
    topic: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    occurred_at: DateTime<Utc>,
    attempt: u32,
    payload: JsonValue,

    #[serde(skip)]
    event: DomainEvent,
}

impl PublishEnvelope {
    pub fn new(source: &OutboxEvent, topic: impl Into<String>, event: DomainEvent) -> Self {
        Self {
            event_id: source.id,
            topic: topic.into(),
            aggregate_type: source.aggregate_type.clone(),
            aggregate_id: source.aggregate_id.clone(),
            event_type: source.event_type.clone(),
            occurred_at: source.created_at,
            attempt: source.attempt_count.saturating_add(1),
            payload: source.payload.clone(),
            event,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn event(&self) -> &DomainEvent {
        &self.event
    }

    /// Test hook honoured by the logging sink: a payload carrying
    /// `"force_fail": true` makes delivery fail.
    pub fn forces_failure(&self) -> bool {
        self.payload
            .get("force_fail")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}
