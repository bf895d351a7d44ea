//! Persisted offset types
//!
//! Offsets are stored per source partition: a small string map that
//! identifies the table or query a querier reads. The map shape has changed
//! over time, so a resuming task probes every known shape.

use crate::database::TableId;
use crate::offset::Offset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partition key naming the layout version
pub const PROTOCOL_KEY: &str = "protocol";
/// Partition key naming a table
pub const TABLE_KEY: &str = "table";
/// Partition key used by query sources
pub const QUERY_KEY: &str = "query";
/// Current partition layout version
pub const PROTOCOL_V1: &str = "1";

/// Identifies the source an offset belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePartition(BTreeMap<String, String>);

impl SourcePartition {
    /// Current shape: `{"protocol": "1", "table": "<schema>.<table>"}`
    pub fn table_v1(table: &TableId) -> Self {
        Self::from_pairs([
            (PROTOCOL_KEY, PROTOCOL_V1.to_string()),
            (TABLE_KEY, table.qualified_name()),
        ])
    }

    /// Legacy shape: `{"table": "<table>"}`
    pub fn table_v0(table: &TableId) -> Self {
        Self::from_pairs([(TABLE_KEY, table.table.clone())])
    }

    /// Shape used by free-form query sources: `{"query": "query"}`
    pub fn query() -> Self {
        Self::from_pairs([(QUERY_KEY, QUERY_KEY.to_string())])
    }

    fn from_pairs<const N: usize>(pairs: [(&str, String); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Value of a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Underlying map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl std::fmt::Display for SourcePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

/// All stored offsets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OffsetStateRepr", into = "OffsetStateRepr")]
pub struct OffsetState {
    offsets: BTreeMap<SourcePartition, Offset>,
}

impl OffsetState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset stored for a partition
    pub fn get(&self, partition: &SourcePartition) -> Option<&Offset> {
        self.offsets.get(partition)
    }

    /// Store an offset for a partition
    pub fn set(&mut self, partition: SourcePartition, offset: Offset) {
        self.offsets.insert(partition, offset);
    }

    /// Remove a partition's offset
    pub fn remove(&mut self, partition: &SourcePartition) -> Option<Offset> {
        self.offsets.remove(partition)
    }

    /// First candidate that has a stored offset
    pub fn find_first<'a>(
        &self,
        candidates: &'a [SourcePartition],
    ) -> Option<(&'a SourcePartition, Offset)> {
        candidates
            .iter()
            .find_map(|p| self.offsets.get(p).map(|o| (p, *o)))
    }

    /// Iterate in partition order
    pub fn iter(&self) -> impl Iterator<Item = (&SourcePartition, &Offset)> {
        self.offsets.iter()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// One stored offset in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OffsetEntry {
    partition: SourcePartition,
    offset: Offset,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OffsetStateRepr {
    #[serde(default)]
    offsets: Vec<OffsetEntry>,
}

impl From<OffsetStateRepr> for OffsetState {
    fn from(repr: OffsetStateRepr) -> Self {
        Self {
            offsets: repr
                .offsets
                .into_iter()
                .map(|e| (e.partition, e.offset))
                .collect(),
        }
    }
}

impl From<OffsetState> for OffsetStateRepr {
    fn from(state: OffsetState) -> Self {
        Self {
            offsets: state
                .offsets
                .into_iter()
                .map(|(partition, offset)| OffsetEntry { partition, offset })
                .collect(),
        }
    }
}
