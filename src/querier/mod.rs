//! Table queriers
//!
//! A querier owns the extraction cycle of one table or query: it opens a
//! cursor parameterised by its current offset, turns rows into
//! [`SourceRecord`]s while advancing the offset, and is reset once the
//! cursor is exhausted. Batch queriers additionally gate and commit runs
//! through their [`crate::batch::BatchIdManager`].

mod batch;
mod bulk;
mod incrementing;


pub use batch::BatchIdQuerier;
pub use bulk::BulkQuerier;
pub use incrementing::TimestampIncrementingQuerier;

use crate::database::{quote_identifier, Connection, Row, RowStream, SqlValue, TableId};
use crate::error::{Error, Result};
use crate::offset::Offset;
use crate::state::SourcePartition;
use crate::types::JsonValue;
use chrono::{NaiveDateTime, TimeDelta};
use tracing::debug;

/// Alias of a wrapped free-form query
const QUERY_ALIAS: &str = "source_query";

/// Rows pulled from the database per page of an open cursor
pub const FETCH_SIZE: usize = 1_000;

/// Delay from milliseconds, saturating at the largest representable span
pub(crate) fn delay_from_millis(delay_ms: u64) -> TimeDelta {
    i64::try_from(delay_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

/// `now - delay`, clamped to the earliest representable timestamp
pub(crate) fn delayed(now: NaiveDateTime, delay: TimeDelta) -> NaiveDateTime {
    now.checked_sub_signed(delay).unwrap_or(NaiveDateTime::MIN)
}

/// One extracted row, tagged with its source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Destination topic
    pub topic: String,
    /// Source the row came from
    pub partition: SourcePartition,
    /// Row values
    pub row: Row,
}

impl SourceRecord {
    /// JSON form: `{"topic": .., "partition": {..}, "value": {..}}`
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "topic": self.topic,
            "partition": self.partition,
            "value": self.row.to_json(),
        })
    }
}

/// The extraction cycle of one table or query
pub trait TableQuerier: Send {
    /// Table name (`schema.table`) or `query`
    fn name(&self) -> &str;

    /// Offset key of this source
    fn partition(&self) -> &SourcePartition;

    /// Topic records are tagged with
    fn topic(&self) -> &str;

    /// Whether a cursor is open and not yet exhausted
    fn is_querying(&self) -> bool;

    /// Epoch millis of the last reset
    fn last_update(&self) -> i64;

    fn current_offset(&self) -> Offset;

    /// Replace the in-memory offset, e.g. to discard an aborted cycle
    fn restore_offset(&mut self, offset: Offset);

    /// Whether the task should persist this querier's offset
    fn persists_offset(&self) -> bool {
        true
    }

    /// Gate the next run; `false` means defer
    fn run_pre_processing(&mut self, _conn: &mut dyn Connection) -> Result<bool> {
        Ok(true)
    }

    /// Open a cursor unless one is already open
    fn start_query_if_needed(&mut self, conn: &mut dyn Connection, now: NaiveDateTime)
        -> Result<()>;

    /// Advance the cursor; `false` once exhausted
    fn next(&mut self) -> Result<bool>;

    /// Materialise the current row and advance the offset
    fn extract_record(&mut self) -> Result<SourceRecord>;

    /// Finish a run after the cursor is exhausted
    fn run_post_processing(&mut self, _conn: &mut dyn Connection) -> Result<bool> {
        Ok(true)
    }

    /// Close the cursor and stamp the last update time
    fn reset(&mut self, now_millis: i64);
}

/// What a querier reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    Table(TableId),
    Query(String),
}

/// State shared by every querier kind
#[derive(Debug)]
pub(crate) struct QuerierCore {
    source: QuerySource,
    name: String,
    topic: String,
    partition: SourcePartition,
    cursor: Option<RowStream>,
    last_update: i64,
}

impl QuerierCore {
    pub(crate) fn new(source: QuerySource, topic_prefix: &str) -> Self {
        let (name, topic, partition) = match &source {
            QuerySource::Table(table) => (
                table.qualified_name(),
                format!("{topic_prefix}{}", table.table),
                SourcePartition::table_v1(table),
            ),
            QuerySource::Query(_) => (
                "query".to_string(),
                topic_prefix.to_string(),
                SourcePartition::query(),
            ),
        };

        Self {
            source,
            name,
            topic,
            partition,
            cursor: None,
            last_update: 0,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn partition(&self) -> &SourcePartition {
        &self.partition
    }

    pub(crate) fn last_update(&self) -> i64 {
        self.last_update
    }

    pub(crate) fn is_querying(&self) -> bool {
        self.cursor.is_some()
    }

    /// `SELECT` over the source, ready for a predicate to be appended
    pub(crate) fn base_query(&self) -> String {
        match &self.source {
            QuerySource::Table(table) => format!("SELECT * FROM {}", table.quoted()),
            QuerySource::Query(query) => format!(
                "SELECT * FROM ({}) AS {}",
                query.trim().trim_end_matches(';'),
                quote_identifier(QUERY_ALIAS)
            ),
        }
    }

    pub(crate) fn open(
        &mut self,
        conn: &mut dyn Connection,
        clause: &str,
        params: &[SqlValue],
    ) -> Result<()> {
        let sql = format!("{}{clause}", self.base_query());
        debug!("{} prepared SQL query: {}", self.name, sql);
        self.cursor = Some(conn.stream(&sql, params, FETCH_SIZE)?);
        Ok(())
    }

    pub(crate) fn next(&mut self) -> Result<bool> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.advance(),
            None => Ok(false),
        }
    }

    /// Rows fetched but not yet reached
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.cursor.as_ref().map_or(0, RowStream::buffered)
    }

    pub(crate) fn current_row(&self) -> Result<&Row> {
        self.cursor
            .as_ref()
            .and_then(RowStream::current)
            .ok_or_else(|| Error::data(format!("{} has no current row", self.name)))
    }

    pub(crate) fn record(&self, row: Row) -> SourceRecord {
        SourceRecord {
            topic: self.topic.clone(),
            partition: self.partition.clone(),
            row,
        }
    }

    pub(crate) fn reset(&mut self, now_millis: i64) {
        self.cursor = None;
        self.last_update = now_millis;
    }
}
