//! Idempotent, single-flight initialization.
//!
//! Startup can be requested from many places at once (first run, process
//! start, a supervisor's wake request). [`InitGuard::run`] lets exactly one
//! attempt execute; concurrent callers wait for that attempt and receive its
//! result. A failed or abandoned attempt leaves the guard ready to retry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::EngineError;

type AttemptResult = Option<Result<(), EngineError>>;

#[derive(Debug)]
enum Phase {
    Idle,
    InFlight(watch::Receiver<AttemptResult>),
    Ready,
}

enum Entry {
    Done,
    Wait(watch::Receiver<AttemptResult>),
    Lead(watch::Sender<AttemptResult>),
}

/// Single-flight initialization state.
#[derive(Debug)]
pub struct InitGuard {
    phase: Mutex<Phase>,
    attempts: AtomicU64,
}

impl Default for InitGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl InitGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.phase(), Phase::Ready)
    }

    /// Number of attempts started, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Drops back to uninitialized so the next [`InitGuard::run`] starts a
    /// fresh attempt. An attempt already in flight is left alone.
    pub fn reset(&self) {
        let mut phase = self.phase();
        if matches!(*phase, Phase::Ready) {
            *phase = Phase::Idle;
        }
    }

    /// Runs `attempt` unless the guard is already initialized or another
    /// attempt is in flight, in which case that attempt's result is returned.
    ///
    /// `attempt` receives the 1-based attempt number.
    pub async fn run<F, Fut>(&self, attempt: F) -> Result<(), EngineError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let entry = {
            let mut phase = self.phase();
            if matches!(*phase, Phase::Ready) {
                Entry::Done
            } else if let Phase::InFlight(receiver) = &*phase {
                Entry::Wait(receiver.clone())
            } else {
                let (sender, receiver) = watch::channel(None);
                *phase = Phase::InFlight(receiver);
                Entry::Lead(sender)
            }
        };

        let sender = match entry {
            Entry::Done => return Ok(()),
            Entry::Wait(receiver) => return wait_for_attempt(receiver).await,
            Entry::Lead(sender) => sender,
        };

        let number = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let mut in_flight = InFlightAttempt {
            guard: self,
            finished: false,
        };
        let result = attempt(number).await;
        in_flight.finished = true;

        *self.phase() = if result.is_ok() {
            Phase::Ready
        } else {
            Phase::Idle
        };
        sender.send_replace(Some(result.clone()));
        result
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn wait_for_attempt(mut receiver: watch::Receiver<AttemptResult>) -> Result<(), EngineError> {
    let outcome = match receiver.wait_for(Option::is_some).await {
        Ok(result) => result.clone(),
        Err(_) => None,
    };
    outcome.unwrap_or(Err(EngineError::InitAbandoned))
}

/// Resets the guard if the leading attempt is dropped before completing.
struct InFlightAttempt<'a> {
    guard: &'a InitGuard,
    finished: bool,
}

impl Drop for InFlightAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut phase = self.guard.phase();
            if matches!(*phase, Phase::InFlight(_)) {
                *phase = Phase::Idle;
            }
            tracing::warn!("initialization attempt abandoned, guard reset");
        }
    }
}
