//! Watermark persistence
//!
//! The control-table store keeps one row per source table:
//!
//! ```text
//! table_name | start_offset_ts | start_offset_long | last_offset_ts | last_offset_long
//! ```

use super::types::WatermarkRecord;
use crate::database::{timestamp_param, Connection, SqlValue, TableId};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Reads and writes committed watermarks
pub trait WatermarkStore: Send + Sync {
    /// Stored watermark for `table`, if any
    fn load(&self, conn: &mut dyn Connection, table: &str) -> Result<Option<WatermarkRecord>>;

    /// Store the watermark for `table`
    fn save(&self, conn: &mut dyn Connection, table: &str, record: &WatermarkRecord)
        -> Result<()>;

    /// Name for logs
    fn describe(&self) -> String;
}

/// Watermarks in a control table next to the source tables
#[derive(Debug, Clone)]
pub struct TableWatermarkStore {
    table: TableId,
}

impl TableWatermarkStore {
    /// Store backed by the named control table
    pub fn new(table: &str) -> Result<Self> {
        Ok(Self {
            table: TableId::parse(table)?,
        })
    }

    fn ensure_table(&self, conn: &mut dyn Connection) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             table_name VARCHAR PRIMARY KEY, \
             start_offset_ts TIMESTAMP_NS, \
             start_offset_long BIGINT, \
             last_offset_ts TIMESTAMP_NS, \
             last_offset_long BIGINT)",
            self.table.quoted()
        );
        conn.execute(&sql, &[])?;
        Ok(())
    }
}

fn ts_param(value: Option<chrono::NaiveDateTime>) -> (&'static str, SqlValue) {
    value.map_or(("?", SqlValue::Null), timestamp_param)
}

fn long_param(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Int)
}

impl WatermarkStore for TableWatermarkStore {
    fn load(&self, conn: &mut dyn Connection, table: &str) -> Result<Option<WatermarkRecord>> {
        self.ensure_table(conn)?;

        let sql = format!(
            "SELECT start_offset_ts, start_offset_long, last_offset_ts, last_offset_long \
             FROM {} WHERE table_name = ?",
            self.table.quoted()
        );
        let mut cursor = conn.query(&sql, &[SqlValue::from(table)])?;
        if !cursor.advance() {
            return Ok(None);
        }

        Ok(cursor.current().map(|row| {
            let ts = |i: usize| row.get(i).and_then(SqlValue::as_timestamp);
            let long = |i: usize| row.get(i).and_then(SqlValue::as_i64);
            WatermarkRecord {
                start_offset_ts: ts(0),
                start_offset_long: long(1),
                last_offset_ts: ts(2),
                last_offset_long: long(3),
            }
        }))
    }

    fn save(
        &self,
        conn: &mut dyn Connection,
        table: &str,
        record: &WatermarkRecord,
    ) -> Result<()> {
        self.ensure_table(conn)?;

        let (start_ts, start_ts_param) = ts_param(record.start_offset_ts);
        let (last_ts, last_ts_param) = ts_param(record.last_offset_ts);
        let values = [
            start_ts_param,
            long_param(record.start_offset_long),
            last_ts_param,
            long_param(record.last_offset_long),
            SqlValue::from(table),
        ];

        let update = format!(
            "UPDATE {} SET start_offset_ts = {start_ts}, start_offset_long = ?, \
             last_offset_ts = {last_ts}, last_offset_long = ? WHERE table_name = ?",
            self.table.quoted()
        );
        if conn.execute(&update, &values)? > 0 {
            debug!("Updated watermark of {} in {}", table, self.table);
            return Ok(());
        }

        let insert = format!(
            "INSERT INTO {} (start_offset_ts, start_offset_long, last_offset_ts, \
             last_offset_long, table_name) VALUES ({start_ts}, ?, {last_ts}, ?, ?)",
            self.table.quoted()
        );
        conn.execute(&insert, &values)?;
        debug!("Inserted watermark of {} into {}", table, self.table);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("table {}", self.table)
    }
}

/// Watermarks held in memory, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryWatermarkStore {
    records: Arc<Mutex<HashMap<String, WatermarkRecord>>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record for a table
    pub fn get(&self, table: &str) -> Option<WatermarkRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(table).cloned())
    }

    /// Seed a record
    pub fn insert(&self, table: impl Into<String>, record: WatermarkRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(table.into(), record);
        }
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self, _conn: &mut dyn Connection, table: &str) -> Result<Option<WatermarkRecord>> {
        Ok(self.get(table))
    }

    fn save(
        &self,
        _conn: &mut dyn Connection,
        table: &str,
        record: &WatermarkRecord,
    ) -> Result<()> {
        self.insert(table, record.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
