//! The outbox row model and its state transitions.
//!
//! ## Lifecycle
//!
//! ```text
//!            enqueue (same tx as business write)
//!                         │
//!                         ▼
//!   ┌──────────────── PENDING ◄──────────────┐
//!   │                     │                  │ failure, attempts < ceiling
//!   │ publish ok          │ claim            │ (next_attempt_at = backoff)
//!   ▼                     └──────────────────┘
//! PROCESSED                                  │ failure, attempts == ceiling
//!                                            ▼
//!                                          DEAD (dead_letter = true)
//! ```
//!
//! Transitions here are pure; stores persist the resulting row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use outpost_core::{ClaimToken, DomainError, EventId};

use crate::event::{DomainEvent, PayloadError};
use crate::retry::RetryPolicy;

/// Upper bound (in characters) for `last_error`.
pub const MAX_ERROR_LEN: usize = 1000;

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be (re)published.
    Pending,
    /// Published; a receipt exists.
    Processed,
    /// Retry budget exhausted; out of the retry pool.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Dead => "dead",
        }
    }

    /// Terminal rows are only ever touched again by the sweeper (or manual replay).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Dead)
    }
}

impl core::str::FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processed" => Ok(OutboxStatus::Processed),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(DomainError::validation(format!("unknown outbox status '{other}'"))),
        }
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event to be written to the outbox inside a business transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build the row for a typed event whose variant knows its aggregate.
    pub fn from_domain(event: &DomainEvent) -> Result<Self, PayloadError> {
        let (aggregate_type, aggregate_id) = event
            .aggregate()
            .ok_or_else(|| PayloadError::Serialize(event.event_type().to_string()))?;

        Ok(Self::new(
            aggregate_type,
            aggregate_id,
            event.event_type(),
            event.to_payload()?,
        ))
    }

    /// Materialize the stored row: PENDING, no attempts, immediately eligible.
    pub fn into_event(self, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: EventId::new(),
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            status: OutboxStatus::Pending,
            created_at,
            processed_at: None,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            dead_letter: false,
            claimed_by: None,
            claimed_until: None,
        }
    }
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Number of failed publish attempts.
    pub attempt_count: u32,
    /// Earliest time the event may be claimed again (`None` = now).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Mirrors `status == Dead`.
    pub dead_letter: bool,
    /// Worker currently holding the row.
    pub claimed_by: Option<ClaimToken>,
    /// Claim lease expiry; after it the row is claimable again.
    pub claimed_until: Option<DateTime<Utc>>,
}

/// What a failed attempt did to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still PENDING; eligible again at `next_attempt_at`.
    Retry { next_attempt_at: DateTime<Utc> },
    /// Retry ceiling reached; the event is DEAD.
    DeadLettered,
}

impl OutboxEvent {
    /// Whether a claimer may take this row at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && !self.dead_letter
            && self.next_attempt_at.is_none_or(|at| at <= now)
            && self.claimed_until.is_none_or(|until| until <= now)
    }

    /// Whether `token` currently owns the claim on this row.
    pub fn is_claimed_by(&self, token: ClaimToken) -> bool {
        self.claimed_by == Some(token)
    }

    /// Whether `token` owns the claim and its lease has not lapsed at `now`.
    pub fn holds_live_claim(&self, token: ClaimToken, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.is_claimed_by(token)
            && self.claimed_until.is_some_and(|until| until > now)
    }

    pub fn claim(&mut self, token: ClaimToken, until: DateTime<Utc>) {
        self.claimed_by = Some(token);
        self.claimed_until = Some(until);
    }

    fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }

    /// Successful publish. `attempt_count` is left as it was.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Processed;
        self.processed_at = Some(at);
        self.next_attempt_at = None;
        self.release_claim();
    }

    /// Failed publish: count the attempt, keep the error, and either schedule the
    /// next attempt or dead-letter the event.
    pub fn record_failure(
        &mut self,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(truncate_error(error));
        self.release_claim();

        if policy.is_exhausted(self.attempt_count) {
            self.status = OutboxStatus::Dead;
            self.dead_letter = true;
            self.next_attempt_at = None;
            FailureDisposition::DeadLettered
        } else {
            let next_attempt_at = policy.next_attempt_at(self.attempt_count, now);
            self.next_attempt_at = Some(next_attempt_at);
            FailureDisposition::Retry { next_attempt_at }
        }
    }

    /// Manual replay of a dead-lettered event: back into the pool with a fresh budget.
    pub fn requeue(&mut self) -> Result<(), DomainError> {
        if self.status != OutboxStatus::Dead {
            return Err(DomainError::conflict(format!(
                "event {} is {}, only dead events can be requeued",
                self.id, self.status
            )));
        }
        self.status = OutboxStatus::Pending;
        self.dead_letter = false;
        self.attempt_count = 0;
        self.next_attempt_at = None;
        self.release_claim();
        Ok(())
    }
}

/// Durable proof of delivery; at most one per source event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub source_event_id: EventId,
    pub topic: String,
    pub published_at: DateTime<Utc>,
}

/// Bound an error message to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => error[..cut].to_string(),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_event() -> OutboxEvent {
        NewOutboxEvent::new("gift", "g-1", "gift.created", json!({})).into_event(Utc::now())
    }

    #[test]
    fn new_events_are_pending_and_immediately_claimable() {
        let event = pending_event();

        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempt_count, 0);
        assert!(event.next_attempt_at.is_none());
        assert!(!event.dead_letter);
        assert!(event.is_claimable(event.created_at));
    }

    #[test]
    fn failure_schedules_backoff_and_keeps_pending() {
        let mut event = pending_event();
        let now = Utc::now();
        event.claim(ClaimToken::new(), now + chrono::Duration::minutes(5));

        let disposition = event.record_failure("sink unavailable", &RetryPolicy::default(), now);

        let expected = now + chrono::Duration::seconds(30);
        assert_eq!(disposition, FailureDisposition::Retry { next_attempt_at: expected });
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.next_attempt_at, Some(expected));
        assert_eq!(event.last_error.as_deref(), Some("sink unavailable"));
        assert!(event.claimed_by.is_none());
        assert!(!event.is_claimable(now));
        assert!(event.is_claimable(expected));
    }

    #[test]
    fn ceiling_dead_letters_the_event() {
        let mut event = pending_event();
        let policy = RetryPolicy::default();
        let now = Utc::now();

        for _ in 0..9 {
            assert!(matches!(
                event.record_failure("boom", &policy, now),
                FailureDisposition::Retry { .. }
            ));
        }
        assert_eq!(event.record_failure("boom", &policy, now), FailureDisposition::DeadLettered);

        assert_eq!(event.status, OutboxStatus::Dead);
        assert!(event.dead_letter);
        assert_eq!(event.attempt_count, 10);
        assert!(!event.is_claimable(now + chrono::Duration::days(365)));
    }

    #[test]
    fn success_keeps_attempt_count() {
        let mut event = pending_event();
        let now = Utc::now();
        event.record_failure("once", &RetryPolicy::default(), now);

        event.record_success(now);

        assert_eq!(event.status, OutboxStatus::Processed);
        assert_eq!(event.processed_at, Some(now));
        assert_eq!(event.attempt_count, 1);
        assert!(!event.is_claimable(now));
    }

    #[test]
    fn active_claim_hides_the_row_until_the_lease_lapses() {
        let mut event = pending_event();
        let now = Utc::now();
        let until = now + chrono::Duration::minutes(5);
        event.claim(ClaimToken::new(), until);

        assert!(!event.is_claimable(now));
        assert!(event.is_claimable(until));
    }

    #[test]
    fn live_claim_ends_at_the_lease() {
        let mut event = pending_event();
        let token = ClaimToken::new();
        let now = Utc::now();
        let until = now + chrono::Duration::minutes(5);
        event.claim(token, until);

        assert!(event.holds_live_claim(token, now));
        assert!(!event.holds_live_claim(ClaimToken::new(), now));
        assert!(!event.holds_live_claim(token, until));
    }

    #[test]
    fn only_dead_events_can_be_requeued() {
        let mut event = pending_event();
        assert!(event.requeue().is_err());

        let policy = RetryPolicy::default().with_max_attempts(1);
        event.record_failure("boom", &policy, Utc::now());
        event.requeue().unwrap();

        assert_eq!(event.status, OutboxStatus::Pending);
        assert!(!event.dead_letter);
        assert_eq!(event.attempt_count, 0);
        assert_eq!(event.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn error_messages_are_bounded_on_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN + 10);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [OutboxStatus::Pending, OutboxStatus::Processed, OutboxStatus::Dead] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("archived".parse::<OutboxStatus>().is_err());
    }
}
