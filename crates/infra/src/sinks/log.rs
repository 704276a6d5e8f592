//! Sink that writes each delivery as a structured log line.

use async_trait::async_trait;
use tracing::info;

use outpost_events::{PublishEnvelope, Sink, SinkError};

/// Logs every event it receives.
///
/// Payloads carrying `"force_fail": true` are rejected, which lets operators
/// exercise the retry path end to end without a broker.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<(), SinkError> {
        if envelope.forces_failure() {
            return Err(SinkError::Rejected(format!(
                "forced failure requested by event {}",
                envelope.event_id()
            )));
        }

        info!(
            event_id = %envelope.event_id(),
            topic = envelope.topic(),
            event_type = envelope.event_type(),
            aggregate_type = envelope.aggregate_type(),
            aggregate_id = envelope.aggregate_id(),
            attempt = envelope.attempt(),
            payload = %envelope.payload(),
            "event published"
        );
        Ok(())
    }
}
