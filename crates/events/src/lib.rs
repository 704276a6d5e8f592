//! Outbox events: the durable row model, the typed documents carried in their
//! payloads, and the boundary through which they leave the process.
//!
//! Everything in this crate is storage-agnostic. Stores, the dispatcher loop and
//! concrete transports live in `outpost-infra`.

pub mod envelope;
pub mod event;
pub mod in_memory_sink;
pub mod outbox;
pub mod retry;
pub mod sink;
pub mod topic;

pub use envelope::PublishEnvelope;
pub use event::{
    DomainEvent, GiftActivated, GiftCreated, OrderPlaced, OrderStatusChanged, PayloadError,
};
pub use in_memory_sink::InMemorySink;
pub use outbox::{
    FailureDisposition, NewOutboxEvent, OutboxEvent, OutboxStatus, PublishedEvent,
    MAX_ERROR_LEN, truncate_error,
};
pub use retry::RetryPolicy;
pub use sink::{Sink, SinkError};
pub use topic::TopicRouter;
