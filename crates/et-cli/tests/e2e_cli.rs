//! End-to-end tests driving the `et` binary against a temporary database.

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use et_core::{BusyState, EpochStore, FinalizedEpoch, TrackingState};
use et_db::Database;
use tempfile::TempDir;

fn et_binary() -> String {
    env!("CARGO_BIN_EXE_et").to_string()
}

struct Workspace {
    temp: TempDir,
    config: PathBuf,
    db: PathBuf,
}

/// Creates a temp dir with a config file pointing at a fresh database.
/// `extra` is appended to the config file verbatim.
fn workspace(extra: &str) -> Workspace {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("data").join("et.db");
    let config = temp.path().join("et.toml");
    let contents = format!("database_path = {:?}\n{extra}", db.display().to_string());
    std::fs::write(&config, contents).unwrap();
    Workspace { temp, config, db }
}

impl Workspace {
    fn command(&self) -> Command {
        let mut command = Command::new(et_binary());
        command
            .env("HOME", self.temp.path())
            .env("XDG_CONFIG_HOME", self.temp.path().join("config"))
            .env("XDG_DATA_HOME", self.temp.path().join("share"))
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config);
        command
    }

    fn et(&self, args: &[&str]) -> Output {
        self.command()
            .args(args)
            .output()
            .expect("failed to run et")
    }

    fn seed(&self) -> Database {
        std::fs::create_dir_all(self.db.parent().unwrap()).unwrap();
        Database::open(&self.db).unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_epochs_on_empty_database() {
    let ws = workspace("");
    let output = ws.et(&["epochs"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "No epochs recorded.\n");
}

/// Inspection commands never create the database they read.
#[test]
fn test_inspection_commands_do_not_create_database() {
    let ws = workspace("");
    assert!(ws.et(&["status"]).status.success());
    assert_eq!(ws.et(&["health"]).status.code(), Some(1));
    assert!(ws.et(&["epochs", "--json"]).status.success());
    assert!(!ws.db.exists());
}

/// A database opened read-only is left byte-for-byte unchanged.
#[test]
fn test_inspection_commands_leave_database_unchanged() {
    let ws = workspace("");
    let db = ws.seed();
    db.save_liveness(Utc::now()).unwrap();
    drop(db);
    let before = std::fs::read(&ws.db).unwrap();

    assert!(ws.et(&["status", "--json"]).status.success());
    assert!(ws.et(&["health"]).status.success());
    assert!(ws.et(&["epochs"]).status.success());
    assert_eq!(std::fs::read(&ws.db).unwrap(), before);
}

#[test]
fn test_epochs_range_and_json() {
    let ws = workspace("");
    let t0 = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
    let db = ws.seed();
    db.save_finalized_epochs(&[
        FinalizedEpoch {
            timestamp: t0,
            activity_score: 40,
            epoch_duration_minutes: 15,
            is_gap: false,
        },
        FinalizedEpoch::gap(t0 + chrono::Duration::minutes(15), 600_000),
        FinalizedEpoch {
            timestamp: t0 + chrono::Duration::minutes(25),
            activity_score: 90,
            epoch_duration_minutes: 15,
            is_gap: false,
        },
    ])
    .unwrap();
    drop(db);

    let output = ws.et(&["epochs", "--start", "2025-06-02T09:15:00Z", "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let epochs: Vec<FinalizedEpoch> = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(epochs.len(), 2);
    assert!(epochs[0].is_gap);
    assert_eq!(epochs[0].epoch_duration_minutes, 10);
    assert_eq!(epochs[1].activity_score, 90);

    let output = ws.et(&["epochs", "--end", "2025-06-02T09:15:00Z"]);
    assert!(output.status.success());
    assert_eq!(
        stdout(&output),
        "2025-06-02T09:00:00Z   15 min   40\nTotal: 1 epochs, 0 gap(s), mean activity 40.0\n"
    );
}

#[test]
fn test_epochs_rejects_unparseable_time() {
    let ws = workspace("");
    let output = ws.et(&["epochs", "--start", "sometime"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid datetime"));
}

#[test]
fn test_health_exits_non_zero_without_liveness() {
    let ws = workspace("");
    let output = ws.et(&["health"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("Health: stale (no liveness recorded)"));
}

#[test]
fn test_status_json_reports_recent_liveness() {
    let ws = workspace("");
    let now = Utc::now();
    let db = ws.seed();
    db.save_tracking_state(&TrackingState::new(now, BusyState::Active))
        .unwrap();
    db.save_liveness(now).unwrap();
    db.save_init_attempts(3).unwrap();
    drop(db);

    let output = ws.et(&["status", "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let value: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(value["health"]["healthy"], true);
    assert_eq!(value["health"]["init_attempts"], 3);
    assert_eq!(value["tracking"]["last_busy_state"], "active");
    assert!(value["current_epoch"].is_null());

    assert!(ws.et(&["health"]).status.success());
}

#[test]
fn test_clear_deletes_all_data() {
    let ws = workspace("");
    let db = ws.seed();
    db.save_finalized_epoch(&FinalizedEpoch::gap(Utc::now(), 300_000))
        .unwrap();
    drop(db);

    let output = ws.et(&["clear"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "Cleared all epochs and engine state.\n");
    assert_eq!(stdout(&ws.et(&["epochs"])), "No epochs recorded.\n");
}

#[test]
fn test_invalid_engine_config_is_rejected() {
    let ws = workspace("[engine]\nepoch_duration_minutes = 0\n");
    let output = ws.et(&["status"]);
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("epoch_duration_minutes must be greater than zero"),
        "stderr: {}",
        stderr(&output)
    );
}

#[test]
fn test_environment_overrides_config_file() {
    let ws = workspace("");
    let output = ws
        .command()
        .env("ET_ENGINE__TICK_INTERVAL_SECS", "600")
        .arg("status")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("tick_interval_secs"));
}

/// The daemon initializes the store, records liveness, and keeps other
/// daemons and destructive commands away while it runs.
#[test]
fn test_daemon_records_liveness_and_holds_lock() {
    let ws = workspace("[idle]\nidle_command = [\"sh\", \"-c\", \"echo 0\"]\n");
    let mut daemon = ws
        .command()
        .arg("run")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    let liveness = loop {
        let observed = Database::open_read_only(&ws.db)
            .ok()
            .and_then(|db| db.get_liveness().ok().flatten());
        if let Some(at) = observed {
            break Some(at);
        }
        if Instant::now() > deadline {
            break None;
        }
        thread::sleep(Duration::from_millis(100));
    };

    let second = ws.et(&["run"]);
    let clear = ws.et(&["clear"]);
    let health = ws.et(&["health"]);
    let status = ws.et(&["status", "--json"]);

    daemon.kill().unwrap();
    daemon.wait().unwrap();

    assert!(liveness.is_some(), "daemon never recorded liveness");
    assert!(!second.status.success());
    assert!(stderr(&second).contains("already running"));
    assert!(!clear.status.success());
    assert!(stderr(&clear).contains("daemon is running"));
    assert!(health.status.success(), "stdout: {}", stdout(&health));

    let value: serde_json::Value = serde_json::from_str(&stdout(&status)).unwrap();
    assert_eq!(value["tracking"]["is_tracking"], true);
    assert_eq!(value["tracking"]["last_busy_state"], "active");
    assert_eq!(value["current_epoch"]["epoch_duration_minutes"], 15);
    assert_eq!(value["health"]["init_attempts"], 1);
}
