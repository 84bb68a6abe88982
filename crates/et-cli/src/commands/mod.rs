//! CLI subcommand implementations.

pub mod clear;
pub mod epochs;
pub mod health;
pub mod run;
pub mod status;
pub mod util;
