//! The reconciliation engine.
//!
//! Every trigger advances the open epoch by the wall-clock time elapsed since
//! the previous reconciliation, attributing it to the busy state observed at
//! that previous reconciliation. Elapsed time longer than
//! `max_trusted_gap_ms` is not trusted (the process may have been suspended
//! for all of it) and is recorded as a separate gap epoch instead.
//!
//! All mutable state lives in one [`EngineState`] behind an async mutex, so
//! concurrent triggers queue behind each other rather than interleave. The
//! store is the source of truth across restarts; [`Engine::initialize`]
//! always restores from it.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use et_core::{BusyState, EpochAccumulator, EpochStore, FinalizedEpoch, StoreError, TrackingState};
use tokio::sync::Mutex;

use crate::{
    Clock, ConfigError, EngineConfig, EngineError, IdleSource, InitGuard, SourceError, TriggerHost,
};

/// Tracking state is written at least this often while ticks keep arriving.
const STATE_WRITE_INTERVAL: chrono::Duration = chrono::Duration::seconds(30);

/// Tracking state is also written whenever a counter lands on a multiple of this.
const STATE_WRITE_MULTIPLE_SECS: u64 = 30;

/// What caused a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PeriodicTick,
    /// The host reported a new busy state. Time up to this trigger is still
    /// attributed to the previous state.
    BusyStateChanged(BusyState),
}

/// Result of a single reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The engine is not initialized; nothing was done.
    Skipped,
    /// The elapsed interval was recorded as a gap.
    Gap {
        epoch: FinalizedEpoch,
        /// Busy state freshly observed after the gap.
        busy_state: BusyState,
    },
    /// The elapsed interval was added to the open epoch.
    Accumulated {
        delta_secs: u64,
        /// Set when this reconciliation closed an epoch with recorded time.
        finalized: Option<FinalizedEpoch>,
    },
}

/// Read-only copy of the engine's in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub tracking: TrackingState,
    pub accumulator: Option<EpochAccumulator>,
    /// Finalized epochs not yet written to the store.
    pub pending_epochs: usize,
    pub init_attempts: u64,
}

#[derive(Debug)]
struct EngineState {
    tracking: TrackingState,
    accumulator: Option<EpochAccumulator>,
    pending: Vec<FinalizedEpoch>,
    last_state_write: Option<DateTime<Utc>>,
}

/// The epoch reconciliation engine.
pub struct Engine {
    store: Arc<dyn EpochStore>,
    clock: Arc<dyn Clock>,
    source: Arc<dyn IdleSource>,
    host: Arc<dyn TriggerHost>,
    config: RwLock<EngineConfig>,
    guard: InitGuard,
    state: Mutex<Option<EngineState>>,
}

impl Engine {
    /// Creates an uninitialized engine. Call [`Engine::initialize`] before
    /// delivering triggers; until then they are ignored.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EpochStore>,
        clock: Arc<dyn Clock>,
        source: Arc<dyn IdleSource>,
        host: Arc<dyn TriggerHost>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            source,
            host,
            config: RwLock::new(config),
            guard: InitGuard::new(),
            state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.guard.is_initialized()
    }

    /// Number of initialization attempts, including failed ones.
    pub fn init_attempts(&self) -> u64 {
        self.guard.attempts()
    }

    /// Restores state from the store and registers triggers.
    ///
    /// Safe to call any number of times, concurrently or not: once
    /// initialized this returns immediately, and concurrent callers share a
    /// single attempt and its result.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let result = self.guard.run(|attempt| self.load(attempt)).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "engine initialization failed");
        }
        result
    }

    async fn load(&self, attempt: u64) -> Result<(), EngineError> {
        tracing::info!(attempt, "initializing engine");
        if let Err(err) = self.store.save_init_attempts(attempt) {
            tracing::warn!(error = %err, "failed to record initialization attempt");
        }

        let config = self.config();
        config.validate()?;

        let mut slot = self.state.lock().await;
        let now = self.clock.now();

        let (mut tracking, restored_tracking) = match self.store.get_tracking_state()? {
            Some(mut restored) => {
                restored.is_tracking = true;
                (restored, true)
            }
            None => {
                let busy_state = self.query_busy_state(config.idle_threshold_secs).await?;
                (TrackingState::new(now, busy_state), false)
            }
        };
        let (accumulator, restored_epoch) = match self.store.get_current_epoch()? {
            Some(mut restored) => {
                restored.clamp_active();
                (restored, true)
            }
            None => (
                EpochAccumulator::new(now, config.epoch_duration_minutes),
                false,
            ),
        };
        // Tracking state is written less often than the open epoch, so the
        // epoch may already hold time past the stored check time.
        let counted_until = accumulator.counted_until().min(now);
        if counted_until > tracking.last_check_time {
            tracing::debug!(
                stored = %tracking.last_check_time,
                resumed = %counted_until,
                "resuming from the open epoch's counted time"
            );
            tracking.last_check_time = counted_until;
        }

        self.store.save_tracking_state(&tracking)?;
        self.store.save_current_epoch(&accumulator)?;
        self.store.save_liveness(now)?;

        self.source
            .set_detection_interval(config.idle_threshold_secs);
        let tick_registered = self.host.ensure_periodic_tick(config.tick_interval())?;
        let listener_registered = self
            .host
            .ensure_busy_listener(config.busy_poll_interval())?;

        tracing::info!(
            restored_tracking,
            restored_epoch,
            epoch_start = %accumulator.start_time,
            last_check = %tracking.last_check_time,
            busy_state = %tracking.last_busy_state,
            tick_registered,
            listener_registered,
            "engine initialized"
        );

        *slot = Some(EngineState {
            tracking,
            accumulator: Some(accumulator),
            pending: Vec::new(),
            last_state_write: Some(now),
        });
        Ok(())
    }

    /// Advances the open epoch to the current time.
    ///
    /// A no-op until the engine is initialized. On a store failure the
    /// in-memory effect is kept so the next trigger can retry; an
    /// unrecoverable failure also de-initializes the engine and asks the host
    /// for a wake-up.
    pub async fn reconcile(&self, trigger: Trigger) -> Result<ReconcileOutcome, EngineError> {
        if !self.guard.is_initialized() {
            tracing::debug!(?trigger, "engine not initialized, ignoring trigger");
            return Ok(ReconcileOutcome::Skipped);
        }
        let mut slot = self.state.lock().await;
        let Some(state) = slot.as_mut() else {
            return Ok(ReconcileOutcome::Skipped);
        };
        let config = self.config();
        let now = self.clock.now();

        match self.advance(state, trigger, now, &config).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_unrecoverable() => {
                tracing::error!(error = %err, ?trigger, "unrecoverable store error, de-initializing engine");
                *slot = None;
                self.guard.reset();
                self.host.request_wake();
                Err(err)
            }
            Err(err) => {
                tracing::warn!(error = %err, ?trigger, "reconciliation failed, retrying on next trigger");
                Err(err)
            }
        }
    }

    async fn advance(
        &self,
        state: &mut EngineState,
        trigger: Trigger,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<ReconcileOutcome, EngineError> {
        if trigger == Trigger::PeriodicTick {
            if let Err(err) = self.store.save_liveness(now) {
                if err.is_unrecoverable() {
                    return Err(err.into());
                }
                tracing::warn!(error = %err, "failed to record liveness");
            }
        }

        let elapsed_ms = state.tracking.elapsed_ms(now);
        if elapsed_ms > config.max_trusted_gap_ms {
            return self.record_gap(state, now, elapsed_ms, config).await;
        }

        // Sub-second remainders are dropped, not carried.
        let delta_secs = elapsed_ms / 1000;
        let accumulator = state
            .accumulator
            .get_or_insert_with(|| EpochAccumulator::new(now, config.epoch_duration_minutes));
        accumulator.record(delta_secs, state.tracking.last_busy_state.is_active());

        state.tracking.last_check_time = now;
        if let Trigger::BusyStateChanged(next) = trigger {
            if next != state.tracking.last_busy_state {
                tracing::debug!(from = %state.tracking.last_busy_state, to = %next, "busy state transition");
            }
            state.tracking.last_busy_state = next;
        }

        let mut finalized = None;
        if accumulator.is_due(now) {
            let fresh = EpochAccumulator::new(now, config.epoch_duration_minutes);
            let closed = std::mem::replace(accumulator, fresh);
            if let Some(epoch) = closed.clone().finalize() {
                tracing::info!(
                    start = %epoch.timestamp,
                    activity_score = epoch.activity_score,
                    active_seconds = closed.active_seconds,
                    total_seconds = closed.total_seconds,
                    "epoch finalized"
                );
                state.pending.push(epoch.clone());
                finalized = Some(epoch);
            } else {
                tracing::debug!(start = %closed.start_time, "discarding empty epoch");
            }
        }

        let write_state = state_write_due(state.last_state_write, now, accumulator);
        let accumulator = accumulator.clone();

        self.flush_pending(state)?;
        if write_state {
            self.store.save_tracking_state(&state.tracking)?;
            state.last_state_write = Some(now);
        }
        self.store.save_current_epoch(&accumulator)?;

        tracing::debug!(
            ?trigger,
            delta_secs,
            active_seconds = accumulator.active_seconds,
            total_seconds = accumulator.total_seconds,
            state_written = write_state,
            "reconciled"
        );
        Ok(ReconcileOutcome::Accumulated {
            delta_secs,
            finalized,
        })
    }

    async fn record_gap(
        &self,
        state: &mut EngineState,
        now: DateTime<Utc>,
        elapsed_ms: u64,
        config: &EngineConfig,
    ) -> Result<ReconcileOutcome, EngineError> {
        let gap = FinalizedEpoch::gap(state.tracking.last_check_time, elapsed_ms);
        tracing::info!(
            start = %gap.timestamp,
            elapsed_ms,
            minutes = gap.epoch_duration_minutes,
            "unobserved interval recorded as gap"
        );
        state.pending.push(gap.clone());

        let busy_state = match self.query_busy_state(config.idle_threshold_secs).await {
            Ok(busy_state) => busy_state,
            Err(err) => {
                tracing::warn!(error = %err, "busy state query after gap failed, assuming idle");
                BusyState::Idle
            }
        };
        state.tracking.last_busy_state = busy_state;
        state.tracking.last_check_time = now;

        // An epoch with nothing in it yet moves past the gap so that it can
        // never share a start time with the gap record.
        if let Some(accumulator) = state.accumulator.as_mut() {
            if accumulator.is_empty() {
                accumulator.start_time = now;
            }
        }

        self.flush_pending(state)?;
        self.store.save_tracking_state(&state.tracking)?;
        state.last_state_write = Some(now);
        if let Some(accumulator) = &state.accumulator {
            self.store.save_current_epoch(accumulator)?;
        }
        Ok(ReconcileOutcome::Gap {
            epoch: gap,
            busy_state,
        })
    }

    /// Queries the idle source on the blocking pool; sources may run commands.
    async fn query_busy_state(&self, idle_threshold_secs: u32) -> Result<BusyState, SourceError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.query_busy_state(idle_threshold_secs))
            .await
            .unwrap_or_else(|err| {
                Err(SourceError::Command {
                    command: "busy state query".to_string(),
                    message: err.to_string(),
                })
            })
    }

    fn flush_pending(&self, state: &mut EngineState) -> Result<(), StoreError> {
        if state.pending.is_empty() {
            return Ok(());
        }
        self.store.save_finalized_epochs(&state.pending)?;
        tracing::debug!(count = state.pending.len(), "finalized epochs persisted");
        state.pending.clear();
        Ok(())
    }

    /// Applies new settings.
    ///
    /// The open epoch keeps the duration it was created with. When
    /// initialized, the periodic tick and busy listener are rescheduled in
    /// place.
    pub fn update_config(&self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        self.source
            .set_detection_interval(config.idle_threshold_secs);
        if self.guard.is_initialized() {
            self.host.ensure_periodic_tick(config.tick_interval())?;
            self.host
                .ensure_busy_listener(config.busy_poll_interval())?;
        }
        tracing::info!(?config, "engine configuration updated");
        Ok(())
    }

    /// Flushes everything to the store and de-initializes.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut slot = self.state.lock().await;
        self.guard.reset();
        let Some(mut state) = slot.take() else {
            return Ok(());
        };
        state.tracking.is_tracking = false;

        let flushed = self
            .flush_pending(&mut state)
            .and_then(|()| self.store.save_tracking_state(&state.tracking))
            .and_then(|()| match &state.accumulator {
                Some(accumulator) => self.store.save_current_epoch(accumulator),
                None => Ok(()),
            });
        if let Err(err) = flushed {
            tracing::error!(error = %err, "failed to flush engine state on shutdown");
            return Err(err.into());
        }
        tracing::info!("engine shut down");
        Ok(())
    }

    /// Copy of the in-memory state, or `None` when not initialized.
    pub async fn snapshot(&self) -> Option<EngineSnapshot> {
        let slot = self.state.lock().await;
        slot.as_ref().map(|state| EngineSnapshot {
            tracking: state.tracking.clone(),
            accumulator: state.accumulator.clone(),
            pending_epochs: state.pending.len(),
            init_attempts: self.guard.attempts(),
        })
    }
}

fn state_write_due(
    last_write: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    accumulator: &EpochAccumulator,
) -> bool {
    let interval_elapsed =
        last_write.is_none_or(|at| now.signed_duration_since(at) >= STATE_WRITE_INTERVAL);
    interval_elapsed
        || accumulator.total_seconds % STATE_WRITE_MULTIPLE_SECS == 0
        || accumulator.active_seconds % STATE_WRITE_MULTIPLE_SECS == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
    }

    fn accumulator(active_seconds: u64, total_seconds: u64) -> EpochAccumulator {
        EpochAccumulator {
            start_time: t0(),
            active_seconds,
            total_seconds,
            epoch_duration_minutes: 15,
        }
    }

    #[test]
    fn state_write_due_after_interval() {
        let acc = accumulator(7, 7);
        assert!(!state_write_due(Some(t0()), t0() + Duration::seconds(29), &acc));
        assert!(state_write_due(Some(t0()), t0() + Duration::seconds(30), &acc));
        assert!(state_write_due(None, t0(), &acc));
    }

    #[test]
    fn state_write_due_on_counter_multiples() {
        let recent = Some(t0());
        assert!(state_write_due(recent, t0(), &accumulator(7, 60)));
        assert!(state_write_due(recent, t0(), &accumulator(90, 97)));
        assert!(!state_write_due(recent, t0(), &accumulator(7, 97)));
    }
}
