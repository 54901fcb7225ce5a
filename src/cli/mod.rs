//! Command-line interface for pageforge.
//!
//! Provides commands to preview a batch plan, analyze a document end to end
//! with an in-process worker pool, and inspect queue channels.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
