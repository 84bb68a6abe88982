//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Activity epoch tracker.
///
/// Samples whether the user is active or idle and records the result as
/// fixed-length scored epochs, marking time it could not observe as gaps.
#[derive(Debug, Parser)]
#[command(name = "et", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the tracking daemon in the foreground until interrupted.
    Run,

    /// Show tracking state, the open epoch and engine health.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List finalized epochs, oldest first.
    Epochs {
        /// Only epochs starting at or after this time (RFC 3339 or e.g. "2 hours ago").
        #[arg(long)]
        start: Option<String>,

        /// Only epochs starting before this time.
        #[arg(long)]
        end: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check engine liveness. Exits with status 1 when stale.
    Health {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete all recorded epochs and engine state.
    Clear,
}
