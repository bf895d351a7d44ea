//! Output module
//!
//! Handles Arrow RecordBatch creation and Parquet file writing.
//!
//! # Overview
//!
//! This module provides utilities for:
//! - Inferring Arrow schemas from polled records
//! - Converting records to Arrow RecordBatches
//! - Writing Parquet files

mod schema;
mod writer;

pub use schema::{infer_schema, records_to_arrow};
pub use writer::{write_batch_to_parquet, ParquetWriter, ParquetWriterConfig};
