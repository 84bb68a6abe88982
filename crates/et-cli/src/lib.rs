//! Activity epoch tracker CLI library.
//!
//! Wires the reconciliation engine to SQLite storage, the command-backed idle
//! source and a Tokio trigger host, and provides read-only inspection
//! commands over the persisted state.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::Config;
