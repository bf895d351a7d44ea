//! Timestamp and/or incrementing querier

use super::{delay_from_millis, delayed, QuerierCore, QuerySource, SourceRecord, TableQuerier};
use crate::database::Connection;
use crate::error::Result;
use crate::offset::{Offset, QueryBounds, TimestampIncrementingCriteria};
use crate::state::SourcePartition;
use chrono::{NaiveDateTime, TimeDelta};

/// Reads rows newer than its offset
///
/// Covers the incrementing, timestamp and timestamp+incrementing modes,
/// depending on which columns the criteria carry. Rows with a timestamp
/// later than `now - delay` are left for a later cycle.
#[derive(Debug)]
pub struct TimestampIncrementingQuerier {
    core: QuerierCore,
    criteria: TimestampIncrementingCriteria,
    offset: Offset,
    delay: TimeDelta,
}

impl TimestampIncrementingQuerier {
    pub fn new(
        source: QuerySource,
        topic_prefix: &str,
        criteria: TimestampIncrementingCriteria,
        offset: Option<Offset>,
        delay_ms: u64,
    ) -> Self {
        Self {
            core: QuerierCore::new(source, topic_prefix),
            criteria,
            offset: offset.unwrap_or_default(),
            delay: delay_from_millis(delay_ms),
        }
    }

    pub fn criteria(&self) -> &TimestampIncrementingCriteria {
        &self.criteria
    }

    fn bounds(&self, now: NaiveDateTime) -> QueryBounds {
        QueryBounds {
            end_timestamp: self.criteria.has_timestamp().then(|| delayed(now, self.delay)),
            max_incrementing: None,
        }
    }
}

impl TableQuerier for TimestampIncrementingQuerier {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn partition(&self) -> &SourcePartition {
        self.core.partition()
    }

    fn topic(&self) -> &str {
        self.core.topic()
    }

    fn is_querying(&self) -> bool {
        self.core.is_querying()
    }

    fn last_update(&self) -> i64 {
        self.core.last_update()
    }

    fn current_offset(&self) -> Offset {
        self.offset
    }

    fn restore_offset(&mut self, offset: Offset) {
        self.offset = offset;
    }

    fn start_query_if_needed(&mut self, conn: &mut dyn Connection, now: NaiveDateTime) -> Result<()> {
        if self.core.is_querying() {
            return Ok(());
        }
        let predicate = self.criteria.predicate(&self.offset, &self.bounds(now));
        self.core.open(conn, &predicate.clause, &predicate.params)
    }

    fn next(&mut self) -> Result<bool> {
        self.core.next()
    }

    fn extract_record(&mut self) -> Result<SourceRecord> {
        let row = self.core.current_row()?.clone();
        self.offset = self.criteria.advance(&self.offset, &row)?;
        Ok(self.core.record(row))
    }

    fn reset(&mut self, now_millis: i64) {
        self.core.reset(now_millis);
    }
}
