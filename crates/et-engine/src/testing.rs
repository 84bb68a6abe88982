//! Deterministic host doubles for exercising the engine without a desktop
//! session or wall-clock waits.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use et_core::BusyState;

use crate::{HostError, IdleSource, SourceError, TriggerHost, WakeSignal};

/// [`IdleSource`] that reports whatever state it was last given.
#[derive(Debug)]
pub struct ScriptedIdleSource {
    state: Mutex<Result<BusyState, SourceError>>,
    queries: AtomicUsize,
    detection_interval: AtomicU32,
}

impl ScriptedIdleSource {
    #[must_use]
    pub const fn new(state: BusyState) -> Self {
        Self {
            state: Mutex::new(Ok(state)),
            queries: AtomicUsize::new(0),
            detection_interval: AtomicU32::new(0),
        }
    }

    pub fn set(&self, state: BusyState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Ok(state);
    }

    /// Makes every query fail until [`ScriptedIdleSource::set`] is called.
    pub fn fail_with(&self, error: SourceError) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Err(error);
    }

    /// Number of queries answered so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl IdleSource for ScriptedIdleSource {
    fn query_busy_state(&self, _idle_threshold_secs: u32) -> Result<BusyState, SourceError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_detection_interval(&self, secs: u32) {
        self.detection_interval.store(secs, Ordering::SeqCst);
    }

    fn detection_interval(&self) -> u32 {
        self.detection_interval.load(Ordering::SeqCst)
    }
}

/// [`TriggerHost`] that records registrations and wake requests.
///
/// Registration follows the same idempotency rules as
/// [`crate::TokioHost`] but never fires anything.
#[derive(Debug, Default)]
pub struct RecordingHost {
    tick: Mutex<Option<Duration>>,
    listener: Mutex<Option<Duration>>,
    tick_registrations: AtomicUsize,
    listener_registrations: AtomicUsize,
    wakes: AtomicUsize,
}

impl RecordingHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Period of the currently registered tick, if any.
    pub fn tick_period(&self) -> Option<Duration> {
        *self.tick.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of times a tick was created or rescheduled.
    pub fn tick_registrations(&self) -> usize {
        self.tick_registrations.load(Ordering::SeqCst)
    }

    pub fn listener_registrations(&self) -> usize {
        self.listener_registrations.load(Ordering::SeqCst)
    }

    pub fn wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }
}

fn record(slot: &Mutex<Option<Duration>>, counter: &AtomicUsize, period: Duration) -> bool {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if *slot == Some(period) {
        return false;
    }
    *slot = Some(period);
    counter.fetch_add(1, Ordering::SeqCst);
    true
}

impl WakeSignal for RecordingHost {
    fn request_wake(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

impl TriggerHost for RecordingHost {
    fn ensure_periodic_tick(&self, period: Duration) -> Result<bool, HostError> {
        Ok(record(&self.tick, &self.tick_registrations, period))
    }

    fn ensure_busy_listener(&self, poll_every: Duration) -> Result<bool, HostError> {
        Ok(record(&self.listener, &self.listener_registrations, poll_every))
    }
}
