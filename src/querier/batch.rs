//! Batch-mode querier

use super::{delay_from_millis, delayed, QuerierCore, QuerySource, SourceRecord, TableQuerier};
use crate::batch::{BatchIdManager, BatchOffset, BatchType};
use crate::database::{Connection, TableId};
use crate::error::Result;
use crate::offset::{Offset, QueryBounds, TimestampIncrementingCriteria};
use crate::state::SourcePartition;
use chrono::{NaiveDateTime, TimeDelta};

/// Extracts a table in runs bounded by its batch watermark
///
/// The querier consults its [`BatchIdManager`] around every run: the gate
/// check before the cursor opens and the commit once it is exhausted. Rows
/// are selected above the in-memory offset, which starts at the manager's
/// last committed watermark, and up to the run's resolved upper bound.
#[derive(Debug)]
pub struct BatchIdQuerier {
    core: QuerierCore,
    criteria: TimestampIncrementingCriteria,
    offset: Offset,
    manager: BatchIdManager,
    delay: TimeDelta,
}

impl BatchIdQuerier {
    pub fn new(table: TableId, topic_prefix: &str, manager: BatchIdManager, delay_ms: u64) -> Self {
        let criteria = match manager.batch_type() {
            BatchType::Timestamp { column } => {
                TimestampIncrementingCriteria::timestamp(vec![column.clone()])
            }
            BatchType::Incrementing { column } => {
                TimestampIncrementingCriteria::incrementing(column.clone())
            }
        };

        Self {
            core: QuerierCore::new(QuerySource::Table(table), topic_prefix),
            criteria,
            offset: manager.last_offset().to_offset(),
            manager,
            delay: delay_from_millis(delay_ms),
        }
    }

    pub fn manager(&self) -> &BatchIdManager {
        &self.manager
    }

    fn bounds(&self, now: NaiveDateTime) -> QueryBounds {
        match (self.manager.run_to(), self.manager.batch_type()) {
            (Some(BatchOffset::Timestamp(end)), _) => QueryBounds {
                end_timestamp: Some(end),
                max_incrementing: None,
            },
            (Some(BatchOffset::Long(max)), _) => QueryBounds {
                end_timestamp: None,
                max_incrementing: Some(max),
            },
            (None, BatchType::Timestamp { .. }) => QueryBounds {
                end_timestamp: Some(delayed(now, self.delay)),
                max_incrementing: None,
            },
            (None, BatchType::Incrementing { .. }) => QueryBounds::default(),
        }
    }
}

impl TableQuerier for BatchIdQuerier {
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

    fn persists_offset(&self) -> bool {
        false
    }

    fn run_pre_processing(&mut self, conn: &mut dyn Connection) -> Result<bool> {
        self.manager.check_pre_run(conn)
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
        let old = self.offset;
        self.offset = self.criteria.advance(&old, &row)?;
        self.manager.record_transition(&old, &self.offset);
        Ok(self.core.record(row))
    }

    fn run_post_processing(&mut self, conn: &mut dyn Connection) -> Result<bool> {
        self.manager.commit(conn, &self.offset)
    }

    fn reset(&mut self, now_millis: i64) {
        self.core.reset(now_millis);
    }
}
