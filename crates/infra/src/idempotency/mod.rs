//! Idempotency records and the guard built on them.

pub mod guard;
pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use guard::{GuardError, GuardPolicy, Guarded, IdempotencyGuard};
pub use in_memory::InMemoryIdempotencyStore;
pub use postgres::PgIdempotencyStore;
pub use store::{IdempotencyStore, IdempotencyStoreError};
pub use types::{Begin, IdempotencyKey, IdempotencyRecord, IdempotencyScope};
