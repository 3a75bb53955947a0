//! Command-line interface for cakit.
//!
//! Provides the `run`, `install` and `configure` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, AgentSelector, Cli, Commands};
