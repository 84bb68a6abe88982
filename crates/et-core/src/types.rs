//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Invalid busy state value.
    #[error("invalid busy state: {value}")]
    InvalidBusyState { value: String },
}

/// Host activity classification as reported by the idle sensor.
///
/// Only [`BusyState::Active`] time counts towards an epoch's activity score;
/// idle and locked time still advance the epoch's wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyState {
    /// The user interacted with the host within the idle threshold.
    #[default]
    Active,
    /// No input for at least the idle threshold.
    Idle,
    /// The session is locked.
    Locked,
}

impl BusyState {
    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Locked => "locked",
        }
    }

    /// Whether time spent in this state counts as activity.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for BusyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BusyState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "locked" => Ok(Self::Locked),
            _ => Err(ValidationError::InvalidBusyState {
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_state_from_str() {
        assert_eq!("active".parse::<BusyState>().unwrap(), BusyState::Active);
        assert_eq!("idle".parse::<BusyState>().unwrap(), BusyState::Idle);
        assert_eq!("locked".parse::<BusyState>().unwrap(), BusyState::Locked);
        assert!("asleep".parse::<BusyState>().is_err());
    }

    #[test]
    fn busy_state_serializes_lowercase() {
        let json = serde_json::to_string(&BusyState::Locked).unwrap();
        assert_eq!(json, "\"locked\"");
        let parsed: BusyState = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(parsed, BusyState::Idle);
    }

    #[test]
    fn only_active_counts_as_activity() {
        assert!(BusyState::Active.is_active());
        assert!(!BusyState::Idle.is_active());
        assert!(!BusyState::Locked.is_active());
    }
}
