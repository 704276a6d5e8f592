//! Outbox persistence.
//!
//! - `store`: the `OutboxStore` trait and its error type
//! - `in_memory`: lock-backed store for tests/dev
//! - `postgres`: `FOR UPDATE SKIP LOCKED` store and the transactional writer

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::{PgOutboxStore, PgOutboxWriter};
pub use store::{ClaimRequest, OutboxStats, OutboxStore, OutboxStoreError};
