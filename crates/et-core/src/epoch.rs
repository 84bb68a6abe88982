//! Epoch accounting model.
//!
//! An epoch is a fixed-duration bucket of wall-clock time. While open it is an
//! [`EpochAccumulator`] counting total and active seconds; once its duration
//! has elapsed it closes into an immutable [`FinalizedEpoch`] carrying a
//! 0-100 activity score. Time the tracker could not observe is recorded as a
//! separate gap epoch with [`GAP_SCORE`] instead of being folded into either.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::BusyState;

/// Activity score sentinel for gap epochs. Consumers must treat it as "no data".
pub const GAP_SCORE: i32 = -1;

const MS_PER_MINUTE: u64 = 60_000;

/// Process-wide tracking state, mirrored to the store for crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingState {
    pub is_tracking: bool,
    /// Wall-clock time of the last successful reconciliation.
    pub last_check_time: DateTime<Utc>,
    /// Busy state as of `last_check_time`.
    pub last_busy_state: BusyState,
}

impl TrackingState {
    /// Creates a tracking state that starts observing at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>, busy_state: BusyState) -> Self {
        Self {
            is_tracking: true,
            last_check_time: now,
            last_busy_state: busy_state,
        }
    }

    /// Milliseconds since the last reconciliation, never negative.
    ///
    /// A clock that moved backwards yields zero rather than a negative span.
    #[must_use]
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = now
            .signed_duration_since(self.last_check_time)
            .num_milliseconds();
        u64::try_from(elapsed).unwrap_or(0)
    }
}

/// The single open epoch.
///
/// `epoch_duration_minutes` is captured at creation; configuration changes
/// only affect accumulators created afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAccumulator {
    pub start_time: DateTime<Utc>,
    pub active_seconds: u64,
    pub total_seconds: u64,
    pub epoch_duration_minutes: u32,
}

impl EpochAccumulator {
    /// Opens an empty epoch at `start_time`.
    #[must_use]
    pub const fn new(start_time: DateTime<Utc>, epoch_duration_minutes: u32) -> Self {
        Self {
            start_time,
            active_seconds: 0,
            total_seconds: 0,
            epoch_duration_minutes,
        }
    }

    /// Adds `delta_secs` of wall time, attributing it to activity if `active`.
    pub fn record(&mut self, delta_secs: u64, active: bool) {
        self.total_seconds = self.total_seconds.saturating_add(delta_secs);
        if active {
            self.active_seconds = self.active_seconds.saturating_add(delta_secs);
        }
        self.clamp_active();
    }

    /// Restores `active_seconds <= total_seconds`.
    pub fn clamp_active(&mut self) {
        self.active_seconds = self.active_seconds.min(self.total_seconds);
    }

    /// True when no time has been attributed to this epoch yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_seconds == 0
    }

    /// Instant up to which wall time has been counted into this epoch.
    ///
    /// Never later than the reconciliation that last updated it, since
    /// counted time never exceeds the time elapsed since `start_time`.
    #[must_use]
    pub fn counted_until(&self) -> DateTime<Utc> {
        i64::try_from(self.total_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|counted| self.start_time.checked_add_signed(counted))
            .unwrap_or(self.start_time)
    }

    /// Whether the epoch's configured duration has elapsed at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.start_time).num_milliseconds();
        let Ok(elapsed) = u64::try_from(elapsed) else {
            return false;
        };
        elapsed >= u64::from(self.epoch_duration_minutes) * MS_PER_MINUTE
    }

    /// Closes the epoch and scores it.
    ///
    /// Partially filled epochs are scored like full ones. Returns `None` for an
    /// epoch with no recorded time, which is discarded rather than stored.
    #[must_use]
    pub fn finalize(mut self) -> Option<FinalizedEpoch> {
        if self.is_empty() {
            return None;
        }
        self.clamp_active();
        Some(FinalizedEpoch {
            timestamp: self.start_time,
            activity_score: activity_score(self.active_seconds, self.total_seconds),
            epoch_duration_minutes: self.epoch_duration_minutes,
            is_gap: false,
        })
    }
}

/// An immutable, scored epoch keyed by its start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedEpoch {
    pub timestamp: DateTime<Utc>,
    /// 0-100, or [`GAP_SCORE`] for gap records.
    pub activity_score: i32,
    pub epoch_duration_minutes: u32,
    #[serde(default)]
    pub is_gap: bool,
}

impl FinalizedEpoch {
    /// Builds the record for an unobservable interval starting at `start`.
    #[must_use]
    pub fn gap(start: DateTime<Utc>, elapsed_ms: u64) -> Self {
        Self {
            timestamp: start,
            activity_score: GAP_SCORE,
            epoch_duration_minutes: gap_duration_minutes(elapsed_ms),
            is_gap: true,
        }
    }

    /// True if the score is a real 0-100 value or the record is a marked gap.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        if self.is_gap {
            self.activity_score == GAP_SCORE
        } else {
            (0..=100).contains(&self.activity_score)
        }
    }
}

/// Percentage of `total_secs` spent active, rounded half up and clamped to 0-100.
#[must_use]
pub fn activity_score(active_secs: u64, total_secs: u64) -> i32 {
    if total_secs == 0 {
        return 0;
    }
    let active = u128::from(active_secs.min(total_secs));
    let total = u128::from(total_secs);
    let rounded = (active * 200 + total) / (total * 2);
    i32::try_from(rounded.min(100)).unwrap_or(100)
}

/// Gap length in whole minutes, rounded to nearest and never zero.
#[must_use]
pub fn gap_duration_minutes(elapsed_ms: u64) -> u32 {
    let minutes = elapsed_ms.saturating_add(MS_PER_MINUTE / 2) / MS_PER_MINUTE;
    u32::try_from(minutes.max(1)).unwrap_or(u32::MAX)
}
