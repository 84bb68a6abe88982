//! Clear command for deleting all recorded data.

use std::io::Write;

use anyhow::{Context, Result};
use et_core::EpochStore;

use super::util::try_lock;
use crate::Config;

/// Deletes every epoch and all engine state.
///
/// Refuses while a daemon holds the store, since it would immediately
/// rewrite its in-memory state.
pub fn run<W: Write>(writer: &mut W, store: &dyn EpochStore, config: &Config) -> Result<()> {
    let Some(_lock) = try_lock(&config.lock_path())? else {
        anyhow::bail!(
            "an et daemon is running against {}; stop it before clearing",
            config.database_path.display()
        );
    };
    store.clear_all().context("failed to clear store")?;
    tracing::info!(database = %config.database_path.display(), "store cleared");
    writeln!(writer, "Cleared all epochs and engine state.")?;
    Ok(())
}
