//! Busy-state sensing.
//!
//! The engine asks an [`IdleSource`] for the host's current busy state. The
//! stock implementation, [`CommandIdleSource`], shells out to an idle-time
//! command (by default `xprintidle`, which prints milliseconds since the last
//! input) and optionally to a lock-hint command.

use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use et_core::BusyState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Idle source errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// No command was configured.
    #[error("idle command is empty")]
    EmptyCommand,
    /// The command could not be run or exited unsuccessfully.
    #[error("command {command} failed: {message}")]
    Command { command: String, message: String },
    /// The command's output was not a millisecond count.
    #[error("unexpected idle command output: {output:?}")]
    Parse { output: String },
}

/// Host capability reporting whether the user is present.
pub trait IdleSource: Send + Sync {
    /// Classifies the host right now, treating `idle_threshold_secs` without
    /// input as idle.
    fn query_busy_state(&self, idle_threshold_secs: u32) -> Result<BusyState, SourceError>;

    /// Sets the threshold used for change notifications.
    fn set_detection_interval(&self, secs: u32);

    fn detection_interval(&self) -> u32;
}

/// Commands used by [`CommandIdleSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleCommandConfig {
    /// Program and arguments printing milliseconds since the last input.
    pub idle_command: Vec<String>,
    /// Program and arguments printing a truthy value while the session is locked.
    pub lock_command: Option<Vec<String>>,
}

impl Default for IdleCommandConfig {
    fn default() -> Self {
        Self {
            idle_command: vec!["xprintidle".to_string()],
            lock_command: None,
        }
    }
}

/// [`IdleSource`] backed by external commands.
#[derive(Debug)]
pub struct CommandIdleSource {
    config: IdleCommandConfig,
    detection_interval: AtomicU32,
}

impl CommandIdleSource {
    #[must_use]
    pub const fn new(config: IdleCommandConfig, detection_interval_secs: u32) -> Self {
        Self {
            config,
            detection_interval: AtomicU32::new(detection_interval_secs),
        }
    }

    fn is_locked(&self) -> bool {
        let Some(command) = &self.config.lock_command else {
            return false;
        };
        match run_command(command) {
            Ok(output) => parse_lock_hint(&output),
            Err(err) => {
                tracing::warn!(error = %err, "lock hint command failed, assuming unlocked");
                false
            }
        }
    }
}

impl IdleSource for CommandIdleSource {
    fn query_busy_state(&self, idle_threshold_secs: u32) -> Result<BusyState, SourceError> {
        if self.is_locked() {
            return Ok(BusyState::Locked);
        }
        let output = run_command(&self.config.idle_command)?;
        let idle_ms = output
            .parse::<u64>()
            .map_err(|_| SourceError::Parse { output })?;
        Ok(classify_idle(idle_ms, idle_threshold_secs))
    }

    fn set_detection_interval(&self, secs: u32) {
        self.detection_interval.store(secs, Ordering::Relaxed);
    }

    fn detection_interval(&self) -> u32 {
        self.detection_interval.load(Ordering::Relaxed)
    }
}

/// Active below the threshold, idle at or above it.
fn classify_idle(idle_ms: u64, idle_threshold_secs: u32) -> BusyState {
    if idle_ms >= u64::from(idle_threshold_secs) * 1000 {
        BusyState::Idle
    } else {
        BusyState::Active
    }
}

fn parse_lock_hint(output: &str) -> bool {
    matches!(
        output.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "locked"
    )
}

fn run_command(argv: &[String]) -> Result<String, SourceError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(SourceError::EmptyCommand);
    };
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| SourceError::Command {
            command: program.clone(),
            message: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(SourceError::Command {
            command: program.clone(),
            message: format!("exited with {}", output.status),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn classify_idle_uses_threshold() {
        assert_eq!(classify_idle(59_999, 60), BusyState::Active);
        assert_eq!(classify_idle(60_000, 60), BusyState::Idle);
    }

    #[test]
    fn lock_hint_accepts_common_truthy_values() {
        assert!(parse_lock_hint("yes\n"));
        assert!(parse_lock_hint("TRUE"));
        assert!(!parse_lock_hint("no"));
        assert!(!parse_lock_hint(""));
    }

    #[test]
    fn command_source_reads_idle_milliseconds() {
        let source = CommandIdleSource::new(
            IdleCommandConfig {
                idle_command: sh("echo 120000"),
                lock_command: None,
            },
            60,
        );
        assert_eq!(source.query_busy_state(60).unwrap(), BusyState::Idle);
        assert_eq!(source.query_busy_state(300).unwrap(), BusyState::Active);
    }

    #[test]
    fn lock_hint_wins_over_idle_time() {
        let source = CommandIdleSource::new(
            IdleCommandConfig {
                idle_command: sh("echo 0"),
                lock_command: Some(sh("echo yes")),
            },
            60,
        );
        assert_eq!(source.query_busy_state(60).unwrap(), BusyState::Locked);
    }

    #[test]
    fn failing_command_is_an_error() {
        let source = CommandIdleSource::new(
            IdleCommandConfig {
                idle_command: sh("exit 3"),
                lock_command: None,
            },
            60,
        );
        assert!(matches!(
            source.query_busy_state(60),
            Err(SourceError::Command { .. })
        ));
    }

    #[test]
    fn garbage_output_is_a_parse_error() {
        let source = CommandIdleSource::new(
            IdleCommandConfig {
                idle_command: sh("echo soon"),
                lock_command: None,
            },
            60,
        );
        assert_eq!(
            source.query_busy_state(60),
            Err(SourceError::Parse {
                output: "soon".to_string()
            })
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let source = CommandIdleSource::new(
            IdleCommandConfig {
                idle_command: Vec::new(),
                lock_command: None,
            },
            60,
        );
        assert_eq!(source.query_busy_state(60), Err(SourceError::EmptyCommand));
    }

    #[test]
    fn detection_interval_is_updatable() {
        let source = CommandIdleSource::new(IdleCommandConfig::default(), 60);
        source.set_detection_interval(30);
        assert_eq!(source.detection_interval(), 30);
    }
}
