//! Batch watermark types

use crate::database::{escape_string_literal, format_timestamp, SqlValue};
use crate::error::{Error, Result};
use crate::offset::{Offset, NO_INCREMENTING_OFFSET};
use chrono::{NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::sync::Arc;

/// Which column drives a batch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchType {
    /// Runs are bounded by a timestamp column
    Timestamp { column: String },
    /// Runs are bounded by an incrementing (long) column
    Incrementing { column: String },
}

impl BatchType {
    /// The configured column
    pub fn column(&self) -> &str {
        match self {
            BatchType::Timestamp { column } | BatchType::Incrementing { column } => column,
        }
    }

    /// Extract this type's component from an offset
    pub fn offset_value(&self, offset: &Offset) -> Option<BatchOffset> {
        match self {
            BatchType::Timestamp { .. } => offset.timestamp.map(BatchOffset::Timestamp),
            BatchType::Incrementing { .. } => offset.incrementing.map(BatchOffset::Long),
        }
    }

    /// Parse a configured default start; empty means the lowest bound
    pub fn parse_start(&self, value: &str) -> Result<BatchOffset> {
        let value = value.trim();
        match self {
            BatchType::Timestamp { .. } if value.is_empty() => {
                Ok(BatchOffset::Timestamp(NaiveDateTime::default()))
            }
            BatchType::Timestamp { .. } => parse_timestamp(value)
                .map(BatchOffset::Timestamp)
                .ok_or_else(|| {
                    Error::invalid_value(
                        "batch.default_offset_start",
                        format!("'{value}' is not a timestamp (expected YYYY-MM-DD HH:MM:SS)"),
                    )
                }),
            BatchType::Incrementing { .. } if value.is_empty() => {
                Ok(BatchOffset::Long(NO_INCREMENTING_OFFSET))
            }
            BatchType::Incrementing { .. } => value.parse().map(BatchOffset::Long).map_err(|_| {
                Error::invalid_value(
                    "batch.default_offset_start",
                    format!("'{value}' is not an integer"),
                )
            }),
        }
    }

    /// Convert a gating query result into an offset of this type
    pub fn value_from_sql(&self, value: &SqlValue) -> Option<BatchOffset> {
        match self {
            BatchType::Timestamp { .. } => match value {
                SqlValue::Text(s) => parse_timestamp(s),
                other => other.as_timestamp(),
            }
            .map(BatchOffset::Timestamp),
            BatchType::Incrementing { .. } => match value {
                SqlValue::Int(i) => Some(*i),
                SqlValue::Text(s) => s.trim().parse().ok(),
                _ => None,
            }
            .map(BatchOffset::Long),
        }
    }
}

impl std::fmt::Display for BatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchType::Timestamp { column } => write!(f, "timestamp({column})"),
            BatchType::Incrementing { column } => write!(f, "long({column})"),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// A single batch watermark value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOffset {
    Timestamp(NaiveDateTime),
    Long(i64),
}

impl BatchOffset {
    /// Order two values of the same kind; `None` when the kinds differ
    pub fn compare(&self, other: &BatchOffset) -> Option<Ordering> {
        match (self, other) {
            (BatchOffset::Timestamp(a), BatchOffset::Timestamp(b)) => Some(a.cmp(b)),
            (BatchOffset::Long(a), BatchOffset::Long(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Text spliced into a gating query for `__OFFSET__`
    pub fn sql_literal(&self) -> String {
        match self {
            BatchOffset::Timestamp(ts) => format!("'{}'", escape_string_literal(&format_timestamp(ts))),
            BatchOffset::Long(v) => v.to_string(),
        }
    }

    /// The offset a querier starts from at this watermark
    pub fn to_offset(&self) -> Offset {
        match self {
            BatchOffset::Timestamp(ts) => Offset::from_timestamp(*ts),
            BatchOffset::Long(v) => Offset::from_incrementing(*v),
        }
    }

    /// Short kind name for messages
    pub fn kind(&self) -> &'static str {
        match self {
            BatchOffset::Timestamp(_) => "timestamp",
            BatchOffset::Long(_) => "long",
        }
    }
}

impl std::fmt::Display for BatchOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchOffset::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            BatchOffset::Long(v) => write!(f, "{v}"),
        }
    }
}

/// Committed bounds plus the upper bound of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds<T> {
    /// First offset the table was ever read from
    pub start: T,
    /// Last fully consumed run-to offset
    pub last: T,
    /// Upper bound of the run in progress
    pub run_to: Option<T>,
}

impl<T: Copy> Bounds<T> {
    fn new(start: T, last: T) -> Self {
        Self {
            start,
            last,
            run_to: None,
        }
    }
}

/// Watermark of one table, shaped by its batch type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Timestamp(Bounds<NaiveDateTime>),
    Long(Bounds<i64>),
}

impl Watermark {
    /// Watermark with identical start and last
    pub fn starting_at(start: BatchOffset) -> Self {
        match start {
            BatchOffset::Timestamp(ts) => Watermark::Timestamp(Bounds::new(ts, ts)),
            BatchOffset::Long(v) => Watermark::Long(Bounds::new(v, v)),
        }
    }

    /// Restore from a stored record, filling gaps from `default_start`
    pub fn from_record(record: &WatermarkRecord, default_start: BatchOffset) -> Self {
        match default_start {
            BatchOffset::Timestamp(default) => {
                let start = record.start_offset_ts.unwrap_or(default);
                let last = record.last_offset_ts.unwrap_or(start);
                Watermark::Timestamp(Bounds::new(start, last))
            }
            BatchOffset::Long(default) => {
                let start = record.start_offset_long.unwrap_or(default);
                let last = record.last_offset_long.unwrap_or(start);
                Watermark::Long(Bounds::new(start, last))
            }
        }
    }

    pub fn start(&self) -> BatchOffset {
        match self {
            Watermark::Timestamp(b) => BatchOffset::Timestamp(b.start),
            Watermark::Long(b) => BatchOffset::Long(b.start),
        }
    }

    pub fn last(&self) -> BatchOffset {
        match self {
            Watermark::Timestamp(b) => BatchOffset::Timestamp(b.last),
            Watermark::Long(b) => BatchOffset::Long(b.last),
        }
    }

    pub fn run_to(&self) -> Option<BatchOffset> {
        match self {
            Watermark::Timestamp(b) => b.run_to.map(BatchOffset::Timestamp),
            Watermark::Long(b) => b.run_to.map(BatchOffset::Long),
        }
    }

    /// Set the run's upper bound; false if the kind does not match
    pub fn set_run_to(&mut self, value: BatchOffset) -> bool {
        match (self, value) {
            (Watermark::Timestamp(b), BatchOffset::Timestamp(v)) => b.run_to = Some(v),
            (Watermark::Long(b), BatchOffset::Long(v)) => b.run_to = Some(v),
            _ => return false,
        }
        true
    }

    /// Record a completed run: `last` becomes `value`, the run bound clears
    pub fn complete(&mut self, value: BatchOffset) -> bool {
        match (self, value) {
            (Watermark::Timestamp(b), BatchOffset::Timestamp(v)) => {
                b.last = v;
                b.run_to = None;
            }
            (Watermark::Long(b), BatchOffset::Long(v)) => {
                b.last = v;
                b.run_to = None;
            }
            _ => return false,
        }
        true
    }

    /// Persisted form
    pub fn to_record(&self) -> WatermarkRecord {
        match self {
            Watermark::Timestamp(b) => WatermarkRecord {
                start_offset_ts: Some(b.start),
                last_offset_ts: Some(b.last),
                ..WatermarkRecord::default()
            },
            Watermark::Long(b) => WatermarkRecord {
                start_offset_long: Some(b.start),
                last_offset_long: Some(b.last),
                ..WatermarkRecord::default()
            },
        }
    }
}

/// Row of the watermark store for one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatermarkRecord {
    pub start_offset_ts: Option<NaiveDateTime>,
    pub start_offset_long: Option<i64>,
    pub last_offset_ts: Option<NaiveDateTime>,
    pub last_offset_long: Option<i64>,
}

/// Phase of the batch run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchRunState {
    /// No run in progress
    #[default]
    Idle,
    /// Waiting for the gating query to produce an upper bound
    GateCheck,
    /// Rows are being extracted up to the upper bound
    Running,
    /// Cursor exhausted, deciding whether the run completed
    Committing,
}

impl std::fmt::Display for BatchRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchRunState::Idle => write!(f, "idle"),
            BatchRunState::GateCheck => write!(f, "gate_check"),
            BatchRunState::Running => write!(f, "running"),
            BatchRunState::Committing => write!(f, "committing"),
        }
    }
}

/// An observed per-row offset change of a batch querier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTransition {
    /// `schema.table` of the querier
    pub table: String,
    /// Offset before the row, if any
    pub old: Option<BatchOffset>,
    /// Offset after the row
    pub new: BatchOffset,
}

/// Callback receiving every offset transition of batch queriers
pub type TransitionObserver = Arc<dyn Fn(&OffsetTransition) + Send + Sync>;
