//! `outpost-core`: foundation building blocks shared by every outpost crate.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, the domain error model, and the clock abstraction used to make
//! time-dependent policies deterministic under test.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AttemptId, ClaimToken, EventId, GiftId};
