//! CLI module
//!
//! Command-line interface for running a SQL source.
//!
//! # Commands
//!
//! - `validate` - Check the configuration only
//! - `check` - Validate and open a connection
//! - `run` - Poll the source, committing offsets after every batch
//! - `offsets` - Print the stored offsets

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat};
pub use runner::Runner;
