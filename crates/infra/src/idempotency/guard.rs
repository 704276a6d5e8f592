//! Create-before-execute guard around side-effecting operations.
//!
//! The record is written *before* the operation runs; that write is what keeps
//! two concurrent requests with the same key from both executing. A caller that
//! finds the key held waits (polling) for the holder to finish and then replays
//! its result, so every caller of a given key observes the same outcome.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use outpost_core::{SharedClock, SystemClock};

use super::store::{IdempotencyStore, IdempotencyStoreError};
use super::types::{Begin, IdempotencyKey, IdempotencyScope};

/// How long to wait on a concurrent holder, and when to stop waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPolicy {
    /// Longest a caller waits for an in-flight attempt before giving up.
    pub wait_timeout: Duration,
    /// Delay between checks while waiting.
    pub poll_interval: Duration,
    /// An unfinished record untouched for this long belongs to a dead attempt
    /// and may be taken over.
    pub stale_after: Duration,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Result of a guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guarded {
    pub result_id: Uuid,
    /// `true` if the operation ran in an earlier (or concurrent) call.
    pub replayed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    /// Another attempt still holds the key after the wait budget.
    #[error("another request with key {scope}/{key} is still in flight")]
    InFlight {
        scope: IdempotencyScope,
        key: IdempotencyKey,
    },

    #[error(transparent)]
    Store(#[from] IdempotencyStoreError),

    /// The guarded operation itself failed; the key was released.
    #[error("guarded operation failed: {0}")]
    Operation(E),
}

pub struct IdempotencyGuard<S> {
    store: S,
    policy: GuardPolicy,
    clock: SharedClock,
}

impl<S> IdempotencyGuard<S>
where
    S: IdempotencyStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: GuardPolicy::default(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_policy(mut self, policy: GuardPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `operation` at most once per `(scope, key)`.
    ///
    /// `operation` returns the id of the entity it produced; replays return that
    /// same id without invoking `operation`.
    pub async fn execute<F, Fut, E>(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        operation: F,
    ) -> Result<Guarded, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Uuid, E>>,
    {
        let deadline = Instant::now() + self.policy.wait_timeout;
        let stale_after = chrono::Duration::from_std(self.policy.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        loop {
            let now = self.clock.now();
            let stale_before = now.checked_sub_signed(stale_after).unwrap_or(now);

            match self.store.begin(scope, key, now, stale_before).await? {
                Begin::Acquired => break,
                Begin::Completed(result_id) => {
                    debug!(scope = %scope, key = %key, "replaying idempotent result");
                    return Ok(Guarded {
                        result_id,
                        replayed: true,
                    });
                }
                Begin::InFlight => {
                    if Instant::now() >= deadline {
                        return Err(GuardError::InFlight {
                            scope,
                            key: key.clone(),
                        });
                    }
                    sleep(self.policy.poll_interval).await;
                }
            }
        }

        match operation().await {
            Ok(result_id) => {
                self.store
                    .complete(scope, key, result_id, self.clock.now())
                    .await?;
                Ok(Guarded {
                    result_id,
                    replayed: false,
                })
            }
            Err(e) => {
                if let Err(release) = self.store.abandon(scope, key).await {
                    // The record goes stale and is taken over by a later call.
                    warn!(scope = %scope, key = %key, error = %release, "failed to release idempotency key");
                }
                Err(GuardError::Operation(e))
            }
        }
    }
}
