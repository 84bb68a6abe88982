//! Persistence contract for epochs and engine state.
//!
//! The store is the source of truth across restarts; the engine's in-memory
//! state is only a cache of it. Implementations must be safe to share across
//! threads because the health monitor reads through its own handle while the
//! engine writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{EpochAccumulator, FinalizedEpoch, TrackingState};

/// Storage errors.
///
/// [`StoreError::is_unrecoverable`] separates failures that are worth retrying
/// on the next trigger from those that require re-initialization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store has not been opened or its schema is missing.
    #[error("store not initialized")]
    NotInitialized,
    /// The process lost the right to read or write the store.
    #[error("store permission denied: {message}")]
    PermissionDenied { message: String },
    /// A stored value could not be decoded.
    #[error("corrupt value for {key}: {message}")]
    Corrupt { key: String, message: String },
    /// Any other backend failure, assumed transient.
    #[error("store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Whether the engine must re-initialize before reconciling again.
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::NotInitialized | Self::PermissionDenied { .. })
    }
}

/// Durable storage for finalized epochs and engine state.
pub trait EpochStore: Send + Sync {
    fn get_tracking_state(&self) -> Result<Option<TrackingState>, StoreError>;
    fn save_tracking_state(&self, state: &TrackingState) -> Result<(), StoreError>;

    fn get_current_epoch(&self) -> Result<Option<EpochAccumulator>, StoreError>;
    fn save_current_epoch(&self, epoch: &EpochAccumulator) -> Result<(), StoreError>;

    /// Stores a batch of finalized epochs atomically, replacing any record
    /// with the same timestamp.
    fn save_finalized_epochs(&self, epochs: &[FinalizedEpoch]) -> Result<(), StoreError>;

    fn save_finalized_epoch(&self, epoch: &FinalizedEpoch) -> Result<(), StoreError> {
        self.save_finalized_epochs(std::slice::from_ref(epoch))
    }

    /// Lists finalized epochs ordered by timestamp ascending.
    ///
    /// The range is inclusive of `start` and exclusive of `end`; either bound
    /// may be omitted.
    fn get_epochs_in_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FinalizedEpoch>, StoreError>;

    fn get_liveness(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
    fn save_liveness(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn get_init_attempts(&self) -> Result<u64, StoreError>;
    fn save_init_attempts(&self, attempts: u64) -> Result<(), StoreError>;

    /// Deletes every epoch and all engine state.
    fn clear_all(&self) -> Result<(), StoreError>;
}

/// Number of writes observed by a [`MemoryStore`], per record kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCounts {
    pub tracking_state: usize,
    pub current_epoch: usize,
    pub finalized_batches: usize,
    pub liveness: usize,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tracking_state: Option<TrackingState>,
    current_epoch: Option<EpochAccumulator>,
    epochs: BTreeMap<DateTime<Utc>, FinalizedEpoch>,
    liveness: Option<DateTime<Utc>>,
    init_attempts: u64,
    failure: Option<StoreError>,
    writes: WriteCounts,
}

/// In-memory [`EpochStore`].
///
/// Clones share the same underlying data, so a clone can stand in for a second
/// connection to the same store. Failures can be injected with
/// [`MemoryStore::fail_with`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with `error` until cleared.
    pub fn fail_with(&self, error: StoreError) {
        self.lock().failure = Some(error);
    }

    pub fn clear_failure(&self) {
        self.lock().failure = None;
    }

    #[must_use]
    pub fn write_counts(&self) -> WriteCounts {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        let inner = self.lock();
        match &inner.failure {
            Some(err) => Err(err.clone()),
            None => Ok(inner),
        }
    }
}

impl EpochStore for MemoryStore {
    fn get_tracking_state(&self) -> Result<Option<TrackingState>, StoreError> {
        Ok(self.checked()?.tracking_state.clone())
    }

    fn save_tracking_state(&self, state: &TrackingState) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        inner.tracking_state = Some(state.clone());
        inner.writes.tracking_state += 1;
        Ok(())
    }

    fn get_current_epoch(&self) -> Result<Option<EpochAccumulator>, StoreError> {
        Ok(self.checked()?.current_epoch.clone())
    }

    fn save_current_epoch(&self, epoch: &EpochAccumulator) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        inner.current_epoch = Some(epoch.clone());
        inner.writes.current_epoch += 1;
        Ok(())
    }

    fn save_finalized_epochs(&self, epochs: &[FinalizedEpoch]) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        for epoch in epochs {
            inner.epochs.insert(epoch.timestamp, epoch.clone());
        }
        inner.writes.finalized_batches += 1;
        Ok(())
    }

    fn get_epochs_in_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FinalizedEpoch>, StoreError> {
        let inner = self.checked()?;
        Ok(inner
            .epochs
            .values()
            .filter(|epoch| start.is_none_or(|start| epoch.timestamp >= start))
            .filter(|epoch| end.is_none_or(|end| epoch.timestamp < end))
            .cloned()
            .collect())
    }

    fn get_liveness(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.checked()?.liveness)
    }

    fn save_liveness(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        inner.liveness = Some(at);
        inner.writes.liveness += 1;
        Ok(())
    }

    fn get_init_attempts(&self) -> Result<u64, StoreError> {
        Ok(self.checked()?.init_attempts)
    }

    fn save_init_attempts(&self, attempts: u64) -> Result<(), StoreError> {
        self.checked()?.init_attempts = attempts;
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        inner.tracking_state = None;
        inner.current_epoch = None;
        inner.epochs.clear();
        inner.liveness = None;
        inner.init_attempts = 0;
        tracing::info!("cleared in-memory store");
        Ok(())
    }
}
