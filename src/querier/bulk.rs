//! Full-scan querier

use super::{QuerierCore, QuerySource, SourceRecord, TableQuerier};
use crate::database::Connection;
use crate::error::Result;
use crate::offset::Offset;
use crate::state::SourcePartition;
use chrono::NaiveDateTime;

/// Reads the whole table or query on every cycle
#[derive(Debug)]
pub struct BulkQuerier {
    core: QuerierCore,
}

impl BulkQuerier {
    pub fn new(source: QuerySource, topic_prefix: &str) -> Self {
        Self {
            core: QuerierCore::new(source, topic_prefix),
        }
    }
}

impl TableQuerier for BulkQuerier {
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
        Offset::default()
    }

    fn restore_offset(&mut self, _offset: Offset) {}

    fn persists_offset(&self) -> bool {
        false
    }

    fn start_query_if_needed(
        &mut self,
        conn: &mut dyn Connection,
        _now: NaiveDateTime,
    ) -> Result<()> {
        if !self.core.is_querying() {
            self.core.open(conn, "", &[])?;
        }
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        self.core.next()
    }

    fn extract_record(&mut self) -> Result<SourceRecord> {
        let row = self.core.current_row()?.clone();
        Ok(self.core.record(row))
    }

    fn reset(&mut self, now_millis: i64) {
        self.core.reset(now_millis);
    }
}
