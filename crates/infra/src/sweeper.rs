//! Retention sweeps for terminal outbox rows and old idempotency records.
//!
//! Both sweeps delete in bounded batches until a batch comes back empty, so a
//! large backlog never turns into one long-running delete.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use outpost_core::{SharedClock, SystemClock};

use crate::idempotency::{IdempotencyStore, IdempotencyStoreError};
use crate::outbox::{OutboxStore, OutboxStoreError};

pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 500;
pub const DEFAULT_OUTBOX_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(180 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// PROCESSED and DEAD rows created longer ago than this are removed.
    pub outbox: Duration,
    /// Successful records created longer ago than this are removed.
    pub idempotency: Duration,
    pub batch_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            outbox: DEFAULT_OUTBOX_RETENTION,
            idempotency: DEFAULT_IDEMPOTENCY_RETENTION,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("outbox sweep failed after deleting {deleted} rows: {source}")]
    Outbox {
        deleted: u64,
        #[source]
        source: OutboxStoreError,
    },

    #[error("idempotency sweep failed after deleting {deleted} records: {source}")]
    Idempotency {
        deleted: u64,
        #[source]
        source: IdempotencyStoreError,
    },
}

/// Rows removed by one `sweep`. A sweep that failed reports `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub outbox_deleted: Option<u64>,
    pub idempotency_deleted: Option<u64>,
}

pub struct CleanupSweeper<O, I> {
    outbox: O,
    idempotency: I,
    retention: RetentionPolicy,
    clock: SharedClock,
}

impl<O, I> CleanupSweeper<O, I>
where
    O: OutboxStore,
    I: IdempotencyStore,
{
    pub fn new(outbox: O, idempotency: I) -> Self {
        Self {
            outbox,
            idempotency,
            retention: RetentionPolicy::default(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Delete terminal outbox rows past retention. Returns the total removed.
    pub async fn purge_outbox(&self) -> Result<u64, SweepError> {
        let cutoff = self.cutoff(self.retention.outbox);
        let mut deleted = 0;
        loop {
            let batch = self
                .outbox
                .delete_terminal_before(cutoff, self.retention.batch_size)
                .await
                .map_err(|source| SweepError::Outbox { deleted, source })?;
            if batch == 0 {
                break;
            }
            deleted += batch;
        }

        info!(deleted, cutoff = %cutoff, "outbox cleanup finished");
        Ok(deleted)
    }

    /// Delete successful idempotency records past retention.
    pub async fn purge_idempotency(&self) -> Result<u64, SweepError> {
        let cutoff = self.cutoff(self.retention.idempotency);
        let mut deleted = 0;
        loop {
            let batch = self
                .idempotency
                .delete_expired_before(cutoff, self.retention.batch_size)
                .await
                .map_err(|source| SweepError::Idempotency { deleted, source })?;
            if batch == 0 {
                break;
            }
            deleted += batch;
        }

        info!(deleted, cutoff = %cutoff, "idempotency cleanup finished");
        Ok(deleted)
    }

    /// Run both sweeps. A failing sweep is logged and does not stop the other.
    pub async fn sweep(&self) -> SweepReport {
        let outbox_deleted = match self.purge_outbox().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "outbox cleanup aborted");
                None
            }
        };
        let idempotency_deleted = match self.purge_idempotency().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "idempotency cleanup aborted");
                None
            }
        };

        SweepReport {
            outbox_deleted,
            idempotency_deleted,
        }
    }

    fn cutoff(&self, retention: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
