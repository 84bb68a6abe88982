//! Engine error taxonomy.

use et_core::StoreError;
use thiserror::Error;

use crate::{ConfigError, HostError, SourceError};

/// Errors surfaced by the engine.
///
/// Errors are `Clone` so that a single initialization outcome can be handed
/// to every caller awaiting it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The in-flight initialization was dropped before it finished.
    #[error("initialization attempt was abandoned")]
    InitAbandoned,
}

impl EngineError {
    /// Whether the engine must be re-initialized before it can continue.
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_unrecoverable(),
            _ => false,
        }
    }
}
