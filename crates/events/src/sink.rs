//! Delivery boundary (mechanics only).
//!
//! A sink is wherever published events go: a log, a broker stream, an HTTP
//! endpoint. The dispatcher knows nothing about transports; it resolves a topic,
//! builds a [`PublishEnvelope`] and awaits `publish`.
//!
//! ## Delivery Guarantees
//!
//! Sinks see **at-least-once** delivery. A worker can crash after the sink
//! accepted an event but before the outbox row was marked processed; the event
//! is then delivered again once its claim lease lapses. Consumers must dedupe on
//! `event_id`.
//!
//! ## Errors
//!
//! Any error returned from `publish` is treated as transient by the dispatcher:
//! the attempt is counted and the event is rescheduled (or dead-lettered once the
//! retry budget is spent).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::PublishEnvelope;

/// Failure reported by a sink.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("sink rejected event: {0}")]
    Rejected(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<(), SinkError>;
}

#[async_trait]
impl<S> Sink for Arc<S>
where
    S: Sink + ?Sized,
{
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<(), SinkError> {
        (**self).publish(envelope).await
    }
}
