//! CLI commands and argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Incremental SQL table and query extractor
#[derive(Parser, Debug)]
#[command(name = "solidafy-sql-source")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Source configuration file (YAML or JSON)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Offset state file (JSON)
    #[arg(short, long, global = true)]
    pub state: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the source configuration without connecting
    Validate,

    /// Validate the configuration and open a connection
    Check,

    /// Poll the source and emit records
    Run {
        /// Directory for Parquet files (required with `--format parquet`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many non-empty batches
        #[arg(long)]
        max_batches: Option<usize>,

        /// Parquet compression: snappy, zstd, gzip or none
        #[arg(long, default_value = "snappy")]
        compression: String,
    },

    /// Print the stored offsets
    Offsets,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output (one message per line)
    Json,
    /// Human-readable output
    Pretty,
    /// Parquet files
    Parquet,
}
