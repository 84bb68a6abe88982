//! Health command for checking whether the daemon is still reconciling.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use et_core::EpochStore;
use et_engine::{Clock, HealthMonitor};

use super::status::write_health;

/// Prints the health report and returns whether the engine is healthy.
pub fn run<W: Write>(
    writer: &mut W,
    store: Arc<dyn EpochStore>,
    clock: Arc<dyn Clock>,
    stale_threshold_secs: u64,
    json: bool,
) -> Result<bool> {
    let report = HealthMonitor::new(store, clock, stale_threshold_secs).check();
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        write_health(writer, &report)?;
    }
    Ok(report.healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone, Utc};
    use et_core::MemoryStore;
    use et_engine::ManualClock;
    use insta::assert_snapshot;

    #[test]
    fn health_is_stale_after_threshold() {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        let store = MemoryStore::new();
        let clock = ManualClock::new(start);
        store.save_liveness(start).unwrap();
        store.save_init_attempts(1).unwrap();

        let mut output = Vec::new();
        let healthy = run(
            &mut output,
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            180,
            false,
        )
        .unwrap();
        assert!(healthy);

        clock.advance(Duration::minutes(5));
        let mut output = Vec::new();
        let healthy = run(&mut output, Arc::new(store), Arc::new(clock), 180, false).unwrap();
        assert!(!healthy);
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Health: stale (last liveness 2025-06-02T09:00:00Z)
        Init attempts: 1
        ");
    }
}
