// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # Solidafy SQL Source
//!
//! Incremental extraction of rows from SQL tables and queries, resumable
//! from stored offsets.
//!
//! ## Features
//!
//! - **Extraction modes**: bulk, incrementing, timestamp,
//!   timestamp+incrementing and gated batch runs
//! - **Resumable offsets**: committed per table after delivery, probed
//!   under every historical partition key shape on restart
//! - **Batch watermarks**: runs gated by a pre-run query and committed only
//!   when they reach their upper bound
//! - **Fair scheduling**: one connection shared by all tables, least
//!   recently polled table first
//! - **Arrow output**: polled batches as Arrow RecordBatches or Parquet files
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use solidafy_sql_source::{config::SourceConfig, state::StateManager, task::SourceTask, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SourceConfig::from_file("source.yaml")?;
//!     let state = StateManager::from_file("state.json")?;
//!
//!     let mut task = SourceTask::builder(config).with_state(state).start().await?;
//!     while let Some(records) = task.poll().await? {
//!         for record in &records {
//!             println!("{}", record.to_json());
//!         }
//!         task.commit_offsets().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SourceTask                             │
//! │   start() → queriers     poll() → records     commit_offsets()  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//! ┌───────────┬──────────────┬───┴──────────┬───────────┬──────────┐
//! │ Querier   │ Offset       │ Batch        │ State     │ Database │
//! ├───────────┼──────────────┼──────────────┼───────────┼──────────┤
//! │ Bulk      │ Criteria     │ Gate check   │ Partition │ DuckDB   │
//! │ Ts/Inc    │ Bounds       │ Watermarks   │ Probing   │ Retry    │
//! │ Batch     │ Advance      │ Commit       │ JSON file │ Dialect  │
//! └───────────┴──────────────┴──────────────┴───────────┴──────────┘
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types for the SQL source
pub mod error;

/// Common types and type aliases
pub mod types;

/// Source configuration
pub mod config;

/// Database connections, values and dialect helpers
pub mod database;

/// Offsets and the criteria that build incremental queries
pub mod offset;

/// Offset state persistence
pub mod state;

/// Batch watermarks and gated runs
pub mod batch;

/// Table and query queriers
pub mod querier;

/// The poll loop
pub mod task;

/// Arrow/Parquet output
pub mod output;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};
pub use types::*;

pub use config::SourceConfig;
pub use querier::SourceRecord;
pub use task::{SourceTask, SourceTaskBuilder};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
