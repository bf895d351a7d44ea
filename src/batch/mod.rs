//! Batch mode
//!
//! In batch mode a table is extracted in runs bounded by an externally
//! supplied upper bound. The [`BatchIdManager`] resolves that bound with a
//! gating query, and commits it to a [`WatermarkStore`] once the querier has
//! consumed every row up to it.

mod manager;
mod store;
mod types;

#[cfg(test)]
mod tests;

pub use manager::{BatchIdManager, OFFSET_PLACEHOLDER, TABLE_NAME_PLACEHOLDER};
pub use store::{MemoryWatermarkStore, TableWatermarkStore, WatermarkStore};
pub use types::{
    BatchOffset, BatchRunState, BatchType, Bounds, OffsetTransition, TransitionObserver,
    Watermark, WatermarkRecord,
};
