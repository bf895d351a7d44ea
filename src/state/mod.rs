//! State management module
//!
//! Tracks the offset of every source so a restarted task resumes where the
//! last committed batch ended.
//!
//! # Overview
//!
//! The state module provides:
//! - `SourcePartition` - Offset keys, in the current and legacy shapes
//! - `OffsetState` - All stored offsets
//! - `StateManager` - File-based state persistence

mod manager;
mod types;

pub use manager::StateManager;
pub use types::{
    OffsetState, SourcePartition, PROTOCOL_KEY, PROTOCOL_V1, QUERY_KEY, TABLE_KEY,
};

#[cfg(test)]
mod manager_tests;
