//! Command-line interface for trialforge.
//!
//! Provides client commands for submitting jobs and reading results, and the
//! long-running dispatcher, worker and scaler services.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
