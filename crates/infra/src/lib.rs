//! Infrastructure layer: outbox stores and dispatcher, idempotency guard, gift
//! service, retention sweeps, the orchestrator loop and sink transports.
//!
//! Every store comes in two flavours behind one trait: in-memory (tests/dev) and
//! Postgres. The Postgres schema ships in `migrations/`.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod gifts;
pub mod idempotency;
pub mod orchestrator;
pub mod outbox;
pub mod sinks;
pub mod sweeper;

pub use config::{ConfigError, SinkKind, WorkerConfig};
pub use dispatcher::{DispatchError, DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorState, TickReport};
pub use sweeper::{CleanupSweeper, RetentionPolicy, SweepError, SweepReport};

#[cfg(test)]
mod integration_tests;
