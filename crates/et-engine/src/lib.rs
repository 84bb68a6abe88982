//! Epoch reconciliation engine.
//!
//! Turns a stream of periodic ticks and busy-state changes into a gap-free,
//! crash-consistent sequence of scored epochs:
//! - [`Engine`]: reconciles elapsed time into the open epoch, detects
//!   unobservable intervals, finalizes epochs, and coalesces writes
//! - [`InitGuard`]: makes startup safe to invoke repeatedly and concurrently
//! - [`HealthMonitor`]: detects a stalled engine from its persisted liveness
//!   timestamp and asks the host to wake it
//!
//! The host environment is reached only through the [`Clock`], [`IdleSource`]
//! and [`TriggerHost`] capabilities.

mod clock;
mod config;
mod engine;
mod error;
mod guard;
mod health;
mod host;
mod source;
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineSnapshot, ReconcileOutcome, Trigger};
pub use error::EngineError;
pub use guard::InitGuard;
pub use health::{HealthMonitor, HealthReport};
pub use host::{HostError, HostEvent, TokioHost, TriggerHost, WakeSignal};
pub use source::{CommandIdleSource, IdleCommandConfig, IdleSource, SourceError};
