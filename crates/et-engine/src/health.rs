//! Stall detection from the persisted liveness timestamp.
//!
//! The monitor only reads the store, through its own handle, so it keeps
//! working when the engine's task is wedged or gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use et_core::EpochStore;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::{Clock, WakeSignal};

/// Result of a single health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub last_liveness: Option<DateTime<Utc>>,
    /// Initialization attempts recorded by the engine, if readable.
    pub init_attempts: Option<u64>,
}

/// Watches the engine's liveness and asks the host to wake it when stale.
pub struct HealthMonitor {
    store: Arc<dyn EpochStore>,
    clock: Arc<dyn Clock>,
    stale_threshold: chrono::Duration,
    waker: Option<Arc<dyn WakeSignal>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn EpochStore>, clock: Arc<dyn Clock>, stale_threshold_secs: u64) -> Self {
        let secs = i64::try_from(stale_threshold_secs).unwrap_or(i64::MAX);
        Self {
            store,
            clock,
            stale_threshold: chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX),
            waker: None,
        }
    }

    #[must_use]
    pub fn with_waker(mut self, waker: Arc<dyn WakeSignal>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Reads the liveness record. Missing or unreadable liveness is unhealthy.
    pub fn check(&self) -> HealthReport {
        let last_liveness = match self.store.get_liveness() {
            Ok(at) => at,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read liveness");
                None
            }
        };
        let init_attempts = self.store.get_init_attempts().ok();
        let now = self.clock.now();
        let healthy = last_liveness
            .is_some_and(|at| now.signed_duration_since(at) <= self.stale_threshold);
        HealthReport {
            healthy,
            last_liveness,
            init_attempts,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.check().healthy
    }

    /// Asks the host to wake the engine. Advisory.
    pub fn request_wake(&self) {
        match &self.waker {
            Some(waker) => waker.request_wake(),
            None => tracing::debug!("wake requested with no waker attached"),
        }
    }

    /// Checks health and requests a wake if stale.
    pub fn check_and_wake(&self) -> HealthReport {
        let report = self.check();
        if !report.healthy {
            tracing::warn!(
                last_liveness = ?report.last_liveness,
                init_attempts = ?report.init_attempts,
                "engine liveness is stale, requesting wake"
            );
            self.request_wake();
        }
        report
    }

    /// Runs [`HealthMonitor::check_and_wake`] every `every` until `shutdown`
    /// becomes `true` or its sender is dropped.
    pub async fn supervise(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; give the engine one period.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_and_wake();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("health supervisor stopped");
    }
}
