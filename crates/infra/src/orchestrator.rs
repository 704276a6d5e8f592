//! Single control loop driving the dispatcher and the cleanup sweeps.
//!
//! The outbox is polled every `outbox_interval`; both sweeps run whenever
//! `cleanup_interval` has elapsed since the last one. The last-cleanup
//! watermark is carried in [`OrchestratorState`] and threaded through each
//! tick, so one tick is a plain function of its input state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use outpost_core::{SharedClock, SystemClock};
use outpost_events::Sink;

use crate::dispatcher::{DispatchReport, OutboxDispatcher};
use crate::idempotency::IdempotencyStore;
use crate::outbox::OutboxStore;
use crate::sweeper::{CleanupSweeper, SweepReport};

pub const DEFAULT_OUTBOX_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub outbox_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            outbox_interval: DEFAULT_OUTBOX_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// State carried from one tick to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorState {
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

impl OrchestratorState {
    /// Cleanup is due if it never ran or `interval` has passed since it did.
    pub fn cleanup_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_cleanup_at {
            None => true,
            Some(last) => {
                let interval =
                    chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
                now.signed_duration_since(last) >= interval
            }
        }
    }

    pub fn cleaned_at(self, now: DateTime<Utc>) -> Self {
        Self {
            last_cleanup_at: Some(now),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `None` if the pass failed to claim.
    pub dispatch: Option<DispatchReport>,
    /// `None` if cleanup was not due.
    pub sweep: Option<SweepReport>,
}

pub struct Orchestrator<S, K, I> {
    dispatcher: OutboxDispatcher<S, K>,
    sweeper: CleanupSweeper<S, I>,
    config: OrchestratorConfig,
    clock: SharedClock,
}

impl<S, K, I> Orchestrator<S, K, I>
where
    S: OutboxStore,
    K: Sink,
    I: IdempotencyStore,
{
    pub fn new(dispatcher: OutboxDispatcher<S, K>, sweeper: CleanupSweeper<S, I>) -> Self {
        Self {
            dispatcher,
            sweeper,
            config: OrchestratorConfig::default(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for the cleanup watermark.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn dispatcher(&self) -> &OutboxDispatcher<S, K> {
        &self.dispatcher
    }

    /// Drain the outbox once, then sweep if cleanup is due.
    pub async fn tick(&self, state: OrchestratorState) -> (OrchestratorState, TickReport) {
        let dispatch = match self.dispatcher.drain().await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "outbox dispatch failed");
                None
            }
        };

        let now = self.clock.now();
        if !state.cleanup_due(now, self.config.cleanup_interval) {
            return (state, TickReport { dispatch, sweep: None });
        }

        let sweep = self.sweeper.sweep().await;
        (
            state.cleaned_at(now),
            TickReport {
                dispatch,
                sweep: Some(sweep),
            },
        )
    }

    /// Tick every `outbox_interval` until `shutdown` flips to `true` (or its
    /// sender goes away). Returns the final state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> OrchestratorState {
        info!(
            outbox_interval_secs = self.config.outbox_interval.as_secs(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "orchestrator started"
        );

        let mut ticker = interval(self.config.outbox_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = OrchestratorState::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let (next, _) = self.tick(state).await;
                    state = next;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("orchestrator stopped");
        state
    }
}
