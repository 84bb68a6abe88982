//! Configuration loading and management.

use std::path::{Path, PathBuf};

use et_engine::{ConfigError, EngineConfig, IdleCommandConfig};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub idle: IdleCommandConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("et.db"),
            engine: EngineConfig::default(),
            idle: IdleCommandConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: built-in defaults, the user config file, `path`,
    /// then `ET_*` environment variables (`ET_ENGINE__TICK_INTERVAL_SECS=30`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("ET_").split("__"));

        figment.extract()
    }

    /// Checks the engine settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()
    }

    /// Lock file guarding the database against a second daemon.
    pub fn lock_path(&self) -> PathBuf {
        self.database_path.with_extension("lock")
    }
}

/// Returns the platform-specific config directory for et.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("et"))
}

/// Returns the platform-specific data directory for et.
///
/// On Linux: `~/.local/share/et`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("et"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("et.db"));
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_file_overrides_nested_engine_settings() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
database_path = "/tmp/et-test.db"

[engine]
epoch_duration_minutes = 5

[idle]
idle_command = ["echo", "0"]
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/et-test.db"));
        assert_eq!(config.engine.epoch_duration_minutes, 5);
        assert_eq!(config.engine.idle_threshold_secs, 60);
        assert_eq!(config.idle.idle_command, vec!["echo", "0"]);
        assert_eq!(config.idle.lock_command, None);
    }

    #[test]
    fn test_validate_rejects_bad_engine_settings() {
        let mut config = Config::default();
        config.engine.tick_interval_secs = 600;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TickExceedsGapThreshold { .. })
        ));
    }

    #[test]
    fn test_lock_path_sits_next_to_database() {
        let config = Config {
            database_path: PathBuf::from("/data/et/et.db"),
            ..Config::default()
        };
        assert_eq!(config.lock_path(), PathBuf::from("/data/et/et.lock"));
    }
}
