//! Gift persistence and the guarded gift operations.

pub mod in_memory;
pub mod postgres;
pub mod service;
pub mod store;

pub use in_memory::{InMemoryActivationLog, InMemoryGiftStore};
pub use postgres::{PgActivationLog, PgGiftStore};
pub use service::{GiftError, GiftService};
pub use store::{ActivationLog, GiftStore, GiftStoreError};
