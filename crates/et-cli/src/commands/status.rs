//! Status command for showing the persisted engine state.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use et_core::{EpochAccumulator, EpochStore, TrackingState};
use et_engine::{Clock, HealthMonitor, HealthReport};
use serde::Serialize;

use super::util::format_timestamp;
use crate::Config;

/// Everything `et status` reports.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database_path: PathBuf,
    pub health: HealthReport,
    pub tracking: Option<TrackingState>,
    pub current_epoch: Option<EpochAccumulator>,
}

/// Reads the state last written by the daemon. Never touches a running engine.
pub fn collect(
    store: Arc<dyn EpochStore>,
    clock: Arc<dyn Clock>,
    config: &Config,
) -> Result<StatusReport> {
    let tracking = store
        .get_tracking_state()
        .context("failed to read tracking state")?;
    let current_epoch = store
        .get_current_epoch()
        .context("failed to read current epoch")?;
    let health = HealthMonitor::new(store, clock, config.engine.stale_threshold_secs).check();
    Ok(StatusReport {
        database_path: config.database_path.clone(),
        health,
        tracking,
        current_epoch,
    })
}

pub fn run<W: Write>(
    writer: &mut W,
    store: Arc<dyn EpochStore>,
    clock: Arc<dyn Clock>,
    config: &Config,
    json: bool,
) -> Result<()> {
    let report = collect(store, clock, config)?;
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&report)?)?;
        return Ok(());
    }

    writeln!(writer, "Database: {}", report.database_path.display())?;
    write_health(writer, &report.health)?;

    match &report.tracking {
        Some(tracking) => writeln!(
            writer,
            "Tracking: {}, {} as of {}",
            if tracking.is_tracking { "on" } else { "off" },
            tracking.last_busy_state,
            format_timestamp(tracking.last_check_time)
        )?,
        None => writeln!(writer, "Tracking: never started")?,
    }

    match &report.current_epoch {
        Some(epoch) => writeln!(
            writer,
            "Open epoch: {} ({} min), {}s active of {}s",
            format_timestamp(epoch.start_time),
            epoch.epoch_duration_minutes,
            epoch.active_seconds,
            epoch.total_seconds
        )?,
        None => writeln!(writer, "Open epoch: none")?,
    }

    Ok(())
}

/// Writes the health and init-attempt lines shared with `et health`.
pub fn write_health<W: Write>(writer: &mut W, health: &HealthReport) -> Result<()> {
    let verdict = if health.healthy { "ok" } else { "stale" };
    match health.last_liveness {
        Some(at) => writeln!(
            writer,
            "Health: {verdict} (last liveness {})",
            format_timestamp(at)
        )?,
        None => writeln!(writer, "Health: {verdict} (no liveness recorded)")?,
    }
    match health.init_attempts {
        Some(attempts) => writeln!(writer, "Init attempts: {attempts}")?,
        None => writeln!(writer, "Init attempts: unknown")?,
    }
    Ok(())
}
