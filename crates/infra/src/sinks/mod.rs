//! Concrete [`Sink`](outpost_events::Sink) transports.
//!
//! - `log`: one structured log line per event (the default transport)
//! - `redis_streams`: XADD to one Redis stream per topic (`redis` feature)

pub mod log;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use log::LogSink;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamSink, STREAM_PREFIX};
