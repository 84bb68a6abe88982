//! Trigger delivery from the host environment.
//!
//! The engine never schedules itself. It asks a [`TriggerHost`] to deliver a
//! periodic tick and busy-state change notifications, and the host's event
//! loop feeds those back in as [`crate::Trigger`]s. Registration is
//! idempotent: asking twice for the same tick yields one tick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use et_core::BusyState;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::IdleSource;

/// Host errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Registration was attempted outside a Tokio runtime.
    #[error("no async runtime available to schedule triggers")]
    NoRuntime,
}

/// Events delivered by the host to its event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Tick,
    BusyStateChanged(BusyState),
    /// A supervisor asked for the engine to be (re-)initialized.
    Wake,
}

/// Advisory request to wake the engine.
pub trait WakeSignal: Send + Sync {
    fn request_wake(&self);
}

/// Host-side trigger registration.
pub trait TriggerHost: WakeSignal {
    /// Ensures exactly one periodic tick with the given period exists.
    ///
    /// Returns `true` if a registration was created or rescheduled, `false` if
    /// an identical one was already in place.
    fn ensure_periodic_tick(&self, period: Duration) -> Result<bool, HostError>;

    /// Ensures exactly one busy-state change listener exists.
    fn ensure_busy_listener(&self, poll_every: Duration) -> Result<bool, HostError>;
}

#[derive(Debug, Default)]
struct Registrations {
    tick: Option<(Duration, JoinHandle<()>)>,
    listener: Option<(Duration, JoinHandle<()>)>,
}

/// [`TriggerHost`] backed by Tokio tasks.
///
/// Ticks and busy-state changes are sent on the channel returned by
/// [`TokioHost::new`]. The busy-state listener polls the idle source on a
/// blocking thread and emits its first reading, then every change.
pub struct TokioHost {
    events: mpsc::UnboundedSender<HostEvent>,
    source: Arc<dyn IdleSource>,
    runtime: Handle,
    registrations: Mutex<Registrations>,
}

impl TokioHost {
    /// Creates a host bound to the current Tokio runtime.
    pub fn new(
        source: Arc<dyn IdleSource>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HostEvent>), HostError> {
        let runtime = Handle::try_current().map_err(|_| HostError::NoRuntime)?;
        let (events, receiver) = mpsc::unbounded_channel();
        let host = Self {
            events,
            source,
            runtime,
            registrations: Mutex::new(Registrations::default()),
        };
        Ok((host, receiver))
    }

    /// Cancels every registration.
    pub fn shutdown(&self) {
        let mut registrations = self.registrations();
        if let Some((_, handle)) = registrations.tick.take() {
            handle.abort();
        }
        if let Some((_, handle)) = registrations.listener.take() {
            handle.abort();
        }
        tracing::debug!("trigger registrations cancelled");
    }

    fn registrations(&self) -> MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replaces `slot` unless it already holds a live registration with `period`.
fn ensure_registration(
    slot: &mut Option<(Duration, JoinHandle<()>)>,
    period: Duration,
    spawn: impl FnOnce() -> JoinHandle<()>,
) -> bool {
    if let Some((existing, handle)) = slot.as_ref() {
        if *existing == period && !handle.is_finished() {
            return false;
        }
        handle.abort();
    }
    *slot = Some((period, spawn()));
    true
}

impl WakeSignal for TokioHost {
    fn request_wake(&self) {
        if self.events.send(HostEvent::Wake).is_err() {
            tracing::debug!("wake requested after event loop closed");
        }
    }
}

impl TriggerHost for TokioHost {
    fn ensure_periodic_tick(&self, period: Duration) -> Result<bool, HostError> {
        let mut registrations = self.registrations();
        let created = ensure_registration(&mut registrations.tick, period, || {
            let events = self.events.clone();
            self.runtime.spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if events.send(HostEvent::Tick).is_err() {
                        break;
                    }
                }
            })
        });
        if created {
            tracing::info!(period_secs = period.as_secs(), "periodic tick registered");
        }
        Ok(created)
    }

    fn ensure_busy_listener(&self, poll_every: Duration) -> Result<bool, HostError> {
        let mut registrations = self.registrations();
        let created = ensure_registration(&mut registrations.listener, poll_every, || {
            let events = self.events.clone();
            let source = Arc::clone(&self.source);
            self.runtime
                .spawn(poll_busy_state(source, events, poll_every))
        });
        if created {
            tracing::info!(
                poll_secs = poll_every.as_secs(),
                "busy state listener registered"
            );
        }
        Ok(created)
    }
}

async fn poll_busy_state(
    source: Arc<dyn IdleSource>,
    events: mpsc::UnboundedSender<HostEvent>,
    poll_every: Duration,
) {
    let mut interval = tokio::time::interval(poll_every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last: Option<BusyState> = None;
    loop {
        interval.tick().await;
        let query_source = Arc::clone(&source);
        let observed = tokio::task::spawn_blocking(move || {
            query_source.query_busy_state(query_source.detection_interval())
        })
        .await;
        let state = match observed {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "busy state poll failed");
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "busy state poll task panicked");
                continue;
            }
        };
        // The first reading is always sent: the engine may hold a state
        // restored from before a restart.
        if last != Some(state) {
            tracing::debug!(%state, "busy state observed");
            if events.send(HostEvent::BusyStateChanged(state)).is_err() {
                break;
            }
        }
        last = Some(state);
    }
}
