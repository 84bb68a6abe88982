//! Epochs command for listing finalized epochs in a time range.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use et_core::{EpochStore, FinalizedEpoch};

use super::util::format_timestamp;

pub fn run<W: Write>(
    writer: &mut W,
    store: &dyn EpochStore,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    json: bool,
) -> Result<()> {
    let epochs = store
        .get_epochs_in_range(start, end)
        .context("failed to read epochs")?;

    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&epochs)?)?;
        return Ok(());
    }

    if epochs.is_empty() {
        writeln!(writer, "No epochs recorded.")?;
        return Ok(());
    }

    for epoch in &epochs {
        let score = if epoch.is_gap {
            "gap".to_string()
        } else {
            format!("{:>3}", epoch.activity_score)
        };
        writeln!(
            writer,
            "{}  {:>3} min  {score}",
            format_timestamp(epoch.timestamp),
            epoch.epoch_duration_minutes
        )?;
    }

    let gaps = epochs.iter().filter(|epoch| epoch.is_gap).count();
    let mean = mean_activity(&epochs)
        .map_or_else(|| "n/a".to_string(), |mean| format!("{mean:.1}"));
    writeln!(
        writer,
        "Total: {} epochs, {gaps} gap(s), mean activity {mean}",
        epochs.len()
    )?;
    Ok(())
}

/// Mean score over observed epochs; gaps carry no data and are skipped.
fn mean_activity(epochs: &[FinalizedEpoch]) -> Option<f64> {
    let scores: Vec<f64> = epochs
        .iter()
        .filter(|epoch| !epoch.is_gap)
        .map(|epoch| f64::from(epoch.activity_score))
        .collect();
    if scores.is_empty() {
        return None;
    }
    let count = f64::from(u32::try_from(scores.len()).unwrap_or(u32::MAX));
    Some(scores.iter().sum::<f64>() / count)
}
