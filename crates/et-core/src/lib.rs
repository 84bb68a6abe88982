//! Core domain model for the epoch tracker.
//!
//! This crate contains the fundamental types and logic for:
//! - Busy state: the ternary active/idle/locked signal reported by the host
//! - Epochs: the open accumulator and the immutable finalized records
//! - Storage: the [`EpochStore`] contract plus an in-memory implementation

mod epoch;
pub mod store;
mod types;

pub use epoch::{
    EpochAccumulator, FinalizedEpoch, GAP_SCORE, TrackingState, activity_score,
    gap_duration_minutes,
};
pub use store::{EpochStore, MemoryStore, StoreError};
pub use types::{BusyState, ValidationError};
