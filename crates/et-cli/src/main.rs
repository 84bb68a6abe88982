use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use et_core::{EpochStore, MemoryStore};
use et_db::Database;
use et_engine::{Clock, SystemClock};
use tracing_subscriber::EnvFilter;

use et_cli::commands::{clear, epochs, health, run, status, util};
use et_cli::{Cli, Commands, Config};

/// Load and validate config, ensuring the database directory exists.
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    Ok(config)
}

fn open_database(config: &Config) -> Result<Arc<Database>> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok(Arc::new(db))
}

/// Opens the store for inspection commands without creating or migrating it.
///
/// A database that does not exist yet reads as empty.
fn open_store_read_only(config: &Config) -> Result<Arc<dyn EpochStore>> {
    if !config.database_path.exists() {
        tracing::debug!(path = %config.database_path.display(), "no database yet, reading as empty");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let db = Database::open_read_only(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok(Arc::new(db))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = load_config(cli.config.as_deref())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut stdout = std::io::stdout().lock();

    match command {
        Commands::Run => run::run(&config)?,
        Commands::Status { json } => {
            let store = open_store_read_only(&config)?;
            status::run(&mut stdout, store, clock, &config, *json)?;
        }
        Commands::Epochs { start, end, json } => {
            let start = start.as_deref().map(util::parse_datetime).transpose()?;
            let end = end.as_deref().map(util::parse_datetime).transpose()?;
            let store = open_store_read_only(&config)?;
            epochs::run(&mut stdout, &*store, start, end, *json)?;
        }
        Commands::Health { json } => {
            let store = open_store_read_only(&config)?;
            let healthy = health::run(
                &mut stdout,
                store,
                clock,
                config.engine.stale_threshold_secs,
                *json,
            )?;
            if !healthy {
                stdout.flush()?;
                std::process::exit(1);
            }
        }
        Commands::Clear => {
            let db = open_database(&config)?;
            clear::run(&mut stdout, &*db, &config)?;
        }
    }

    Ok(())
}
