//! Redis Streams sink: one `XADD` per event onto a stream per topic.
//!
//! Stream keys are `outpost:<topic>`, e.g. `outpost:events.gifts`. Entries carry
//! the event id so consumer groups can dedupe redeliveries.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use outpost_events::{PublishEnvelope, Sink, SinkError};

/// Prefix of every stream key written by [`RedisStreamSink`].
pub const STREAM_PREFIX: &str = "outpost";

/// Approximate cap on entries kept per stream (`XADD MAXLEN ~`).
const DEFAULT_MAX_LEN: usize = 100_000;

/// Publishes over one multiplexed connection, opened on first use and
/// reconnected by the connection manager. Dropping a publish future (the
/// dispatcher's timeout) cancels the command.
pub struct RedisStreamSink {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    prefix: String,
    max_len: usize,
}

impl RedisStreamSink {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, SinkError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            conn: OnceCell::new(),
            prefix: STREAM_PREFIX.to_string(),
            max_len: DEFAULT_MAX_LEN,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    async fn connection(&self) -> Result<ConnectionManager, SinkError> {
        self.conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Sink for RedisStreamSink {
    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id(), topic = envelope.topic()),
        err
    )]
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<(), SinkError> {
        let payload = serde_json::to_string(envelope.payload())
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;

        let entry_id: String = redis::cmd("XADD")
            .arg(self.stream_key(envelope.topic()))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("event_id")
            .arg(envelope.event_id().to_string())
            .arg("event_type")
            .arg(envelope.event_type())
            .arg("aggregate_type")
            .arg(envelope.aggregate_type())
            .arg("aggregate_id")
            .arg(envelope.aggregate_id())
            .arg("occurred_at")
            .arg(envelope.occurred_at().to_rfc3339())
            .arg("attempt")
            .arg(envelope.attempt())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| SinkError::Unavailable(format!("XADD failed: {e}")))?;

        debug!(entry_id = %entry_id, "event appended to stream");
        Ok(())
    }
}
