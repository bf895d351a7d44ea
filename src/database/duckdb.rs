//! DuckDB-backed connections
//!
//! DuckDB serves native databases directly and reaches PostgreSQL, MySQL
//! and SQLite through its scanner extensions, attached as `source_db`.

use super::connection::{ColumnDefinition, Connection, ConnectionFactory};
use super::dialect::TableId;
use super::value::{ResultCursor, Row, RowStream, SqlValue};
use crate::config::{mask_password, ConnectionConfig, DatabaseEngine};
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use duckdb::types::{TimeUnit, Value};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};

/// Days from 0001-01-01 (CE day 1) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Opens DuckDB connections for a configured engine
pub struct DuckDbFactory {
    engine: DatabaseEngine,
    connection_string: String,
    /// In-memory databases are shared by cloning one root connection
    shared: Option<Mutex<duckdb::Connection>>,
}

impl DuckDbFactory {
    /// Create a factory from connection config
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let connection_string = config.connection_string();
        let shared = if config.engine == DatabaseEngine::Duckdb && connection_string == ":memory:"
        {
            Some(Mutex::new(duckdb::Connection::open_in_memory()?))
        } else {
            None
        };

        Ok(Self {
            engine: config.engine,
            connection_string,
            shared,
        })
    }

    /// Factory over a fresh in-memory DuckDB database
    pub fn in_memory() -> Result<Self> {
        Self::new(&ConnectionConfig::default())
    }

    /// Run a batch of statements on a new connection
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn open(&self) -> Result<duckdb::Connection> {
        if let Some(shared) = &self.shared {
            let root = shared
                .lock()
                .map_err(|_| Error::sql("shared in-memory connection is poisoned"))?;
            return Ok(root.try_clone()?);
        }

        match self.engine {
            DatabaseEngine::Duckdb => Ok(duckdb::Connection::open(&self.connection_string)?),
            DatabaseEngine::Postgres => self.attach("postgres", "POSTGRES"),
            DatabaseEngine::Mysql => self.attach("mysql", "MYSQL"),
            DatabaseEngine::Sqlite => self.attach("sqlite", "SQLITE"),
        }
    }

    fn attach(&self, extension: &str, db_type: &str) -> Result<duckdb::Connection> {
        let conn = duckdb::Connection::open_in_memory()?;
        conn.execute_batch(&format!("INSTALL {extension}; LOAD {extension};"))
            .map_err(|e| Error::sql(format!("Failed to load {extension} extension: {e}")))?;

        let attach_sql = format!(
            "ATTACH '{}' AS source_db (TYPE {db_type}); USE source_db;",
            self.connection_string.replace('\'', "''")
        );
        conn.execute_batch(&attach_sql)
            .map_err(|e| Error::sql(format!("Failed to attach {}: {e}", self.engine)))?;
        Ok(conn)
    }
}

impl ConnectionFactory for DuckDbFactory {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self.open()?;
        tracing::debug!("Opened {} connection to {}", self.engine, self.describe());
        Ok(Box::new(DuckDbConnection { conn: Some(conn) }))
    }

    fn describe(&self) -> String {
        mask_password(&self.connection_string)
    }
}

/// A single DuckDB connection
pub struct DuckDbConnection {
    conn: Option<duckdb::Connection>,
}

impl DuckDbConnection {
    fn conn(&self) -> Result<&duckdb::Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::sql("connection is closed"))
    }
}

impl Connection for DuckDbConnection {
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultCursor> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(duckdb::params_from_iter(params.iter().map(to_duckdb_value)))?;

        let mut columns = None;
        let mut fetched = Vec::new();
        while let Some(row) = rows.next()? {
            fetched.push(convert_row(row, &mut columns)?);
        }

        Ok(ResultCursor::new(fetched))
    }

    fn stream(&mut self, sql: &str, params: &[SqlValue], fetch_size: usize) -> Result<RowStream> {
        // The producer reads through its own handle on the same database
        let conn = self.conn()?.try_clone()?;
        let sql = sql.to_string();
        let params: Vec<Value> = params.iter().map(to_duckdb_value).collect();
        let fetch_size = fetch_size.max(1);

        // One page in flight while the consumer works through another
        let (tx, rx) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name("duckdb-cursor".to_string())
            .spawn(move || {
                if let Err(e) = produce_pages(&conn, &sql, params, fetch_size, &tx) {
                    let _ = tx.send(Err(e));
                }
            })
            .map_err(|e| Error::sql(format!("Failed to start cursor thread: {e}")))?;

        RowStream::open(rx)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(sql, duckdb::params_from_iter(params.iter().map(to_duckdb_value)))?;
        Ok(changed)
    }

    fn is_valid(&mut self) -> bool {
        self.conn()
            .and_then(|c| Ok(c.execute_batch("SELECT 1")?))
            .is_ok()
    }

    fn describe_columns(&mut self, table: &TableId) -> Result<Vec<ColumnDefinition>> {
        let mut sql = String::from(
            "SELECT column_name, is_nullable FROM information_schema.columns \
             WHERE table_catalog = current_database() AND table_name = ?",
        );
        let mut params = vec![SqlValue::from(table.table.as_str())];
        if let Some(schema) = &table.schema {
            sql.push_str(" AND table_schema = ?");
            params.push(SqlValue::from(schema.as_str()));
        }
        sql.push_str(" ORDER BY ordinal_position");

        let mut cursor = self.query(&sql, &params)?;
        let mut columns = Vec::new();
        while cursor.advance() {
            if let Some(row) = cursor.current() {
                let name = match row.get(0) {
                    Some(SqlValue::Text(name)) => name.clone(),
                    _ => continue,
                };
                let nullable = matches!(row.get(1), Some(SqlValue::Text(n)) if n.eq_ignore_ascii_case("YES"));
                columns.push(ColumnDefinition { name, nullable });
            }
        }
        Ok(columns)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }
}

/// Send the rows of `sql` to `pages` in chunks of `fetch_size`
///
/// Returns early once the receiving stream is dropped.
fn produce_pages(
    conn: &duckdb::Connection,
    sql: &str,
    params: Vec<Value>,
    fetch_size: usize,
    pages: &SyncSender<Result<Vec<Row>>>,
) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(params))?;

    let mut columns = None;
    let mut page = Vec::with_capacity(fetch_size);
    while let Some(row) = rows.next()? {
        page.push(convert_row(row, &mut columns)?);
        if page.len() == fetch_size {
            let full = std::mem::replace(&mut page, Vec::with_capacity(fetch_size));
            if pages.send(Ok(full)).is_err() {
                return Ok(());
            }
        }
    }
    if !page.is_empty() {
        let _ = pages.send(Ok(page));
    }
    Ok(())
}

/// Convert a driver row, resolving column names once per result
fn convert_row(row: &duckdb::Row<'_>, columns: &mut Option<Arc<[String]>>) -> Result<Row> {
    let names = columns
        .get_or_insert_with(|| row.as_ref().column_names().into())
        .clone();
    let mut values = Vec::with_capacity(names.len());
    for i in 0..names.len() {
        let value: Value = row.get(i)?;
        values.push(from_duckdb_value(value));
    }
    Ok(Row::new(names, values))
}

/// Convert a parameter into a DuckDB value
fn to_duckdb_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Boolean(*b),
        SqlValue::Int(i) => Value::BigInt(*i),
        SqlValue::Double(f) => Value::Double(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        SqlValue::Date(d) => Value::Date32(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
        SqlValue::Timestamp(ts) => {
            Value::Timestamp(TimeUnit::Microsecond, ts.and_utc().timestamp_micros())
        }
    }
}

/// Convert a DuckDB value into an engine-neutral value
fn from_duckdb_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Bool(b),
        Value::TinyInt(i) => SqlValue::Int(i.into()),
        Value::SmallInt(i) => SqlValue::Int(i.into()),
        Value::Int(i) => SqlValue::Int(i.into()),
        Value::BigInt(i) => SqlValue::Int(i),
        Value::UTinyInt(i) => SqlValue::Int(i.into()),
        Value::USmallInt(i) => SqlValue::Int(i.into()),
        Value::UInt(i) => SqlValue::Int(i.into()),
        Value::UBigInt(i) => i64::try_from(i).map_or_else(|_| SqlValue::Text(i.to_string()), SqlValue::Int),
        Value::HugeInt(i) => i64::try_from(i).map_or_else(|_| SqlValue::Text(i.to_string()), SqlValue::Int),
        Value::Float(f) => SqlValue::Double(f64::from(f)),
        Value::Double(f) => SqlValue::Double(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Bytes(b),
        Value::Timestamp(unit, t) => {
            timestamp_from_unit(unit, t).map_or(SqlValue::Int(t), SqlValue::Timestamp)
        }
        Value::Date32(d) => NaiveDate::from_num_days_from_ce_opt(d + UNIX_EPOCH_DAYS_FROM_CE)
            .map_or(SqlValue::Int(d.into()), SqlValue::Date),
        Value::Time64(_, t) => {
            // Microseconds since midnight
            let secs = t / 1_000_000;
            let micros = t % 1_000_000;
            SqlValue::Text(format!(
                "{:02}:{:02}:{:02}.{:06}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                micros
            ))
        }
        other => SqlValue::Text(format!("{other:?}")),
    }
}

fn timestamp_from_unit(unit: TimeUnit, value: i64) -> Option<NaiveDateTime> {
    let (per_second, nanos_per_tick) = match unit {
        TimeUnit::Second => (1, 1_000_000_000),
        TimeUnit::Millisecond => (1_000, 1_000_000),
        TimeUnit::Microsecond => (1_000_000, 1_000),
        TimeUnit::Nanosecond => (1_000_000_000, 1),
    };
    let secs = value.div_euclid(per_second);
    let nanos = value.rem_euclid(per_second) * nanos_per_tick;
    DateTime::from_timestamp(secs, nanos as u32).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::timestamp_param;
    use pretty_assertions::assert_eq;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn seeded() -> DuckDbFactory {
        let factory = DuckDbFactory::in_memory().unwrap();
        factory
            .execute_batch(
                "CREATE TABLE events (id BIGINT NOT NULL, ts TIMESTAMP, note VARCHAR);
                 INSERT INTO events VALUES
                   (1, TIMESTAMP '2024-01-01 00:00:00', 'a'),
                   (2, TIMESTAMP '2024-01-02 00:00:00', NULL);",
            )
            .unwrap();
        factory
    }

    #[test]
    fn test_in_memory_connections_share_data() {
        let factory = seeded();
        let mut conn = factory.connect().unwrap();
        let mut cursor = conn.query("SELECT count(*) AS n FROM events", &[]).unwrap();
        assert!(cursor.advance());
        assert_eq!(cursor.current().unwrap().get_by_name("n"), Some(&SqlValue::Int(2)));
    }

    #[test]
    fn test_query_converts_values_and_binds_params() {
        let factory = seeded();
        let mut conn = factory.connect().unwrap();
        let mut cursor = conn
            .query(
                "SELECT id, ts, note FROM events WHERE ts > ? ORDER BY id",
                &[SqlValue::Timestamp(ts("2024-01-01 00:00:00"))],
            )
            .unwrap();

        assert!(cursor.advance());
        let row = cursor.current().unwrap();
        assert_eq!(row.columns(), ["id", "ts", "note"]);
        assert_eq!(row.get(0), Some(&SqlValue::Int(2)));
        assert_eq!(row.get(1), Some(&SqlValue::Timestamp(ts("2024-01-02 00:00:00"))));
        assert_eq!(row.get(2), Some(&SqlValue::Null));
        assert!(!cursor.advance());
    }

    #[test]
    fn test_execute_and_describe() {
        let factory = seeded();
        let mut conn = factory.connect().unwrap();
        let changed = conn
            .execute("UPDATE events SET note = ? WHERE id = ?", &["z".into(), 2.into()])
            .unwrap();
        assert_eq!(changed, 1);

        let columns = conn
            .describe_columns(&TableId::new(Some("main"), "events"))
            .unwrap();
        assert_eq!(
            columns,
            vec![
                ColumnDefinition { name: "id".into(), nullable: false },
                ColumnDefinition { name: "ts".into(), nullable: true },
                ColumnDefinition { name: "note".into(), nullable: true },
            ]
        );
    }

    #[test]
    fn test_bad_sql_is_transient() {
        let factory = seeded();
        let mut conn = factory.connect().unwrap();
        let err = conn.query("SELECT * FROM missing_table", &[]).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_stream_hands_over_one_page_at_a_time() {
        let factory = DuckDbFactory::in_memory().unwrap();
        factory
            .execute_batch("CREATE TABLE numbers AS SELECT range AS id FROM range(10000);")
            .unwrap();
        let mut conn = factory.connect().unwrap();

        let mut stream = conn
            .stream("SELECT id FROM numbers ORDER BY id", &[], 100)
            .unwrap();
        assert!(stream.advance().unwrap());
        assert_eq!(stream.buffered(), 99);
        assert_eq!(stream.current().unwrap().get(0), Some(&SqlValue::Int(0)));

        let mut last = 0;
        while stream.advance().unwrap() {
            assert!(stream.buffered() < 100);
            last = stream.current().and_then(|r| r.get(0)).and_then(SqlValue::as_i64).unwrap();
        }
        assert_eq!(last, 9_999);
    }

    #[test]
    fn test_stream_reports_bad_sql_on_open() {
        let factory = seeded();
        let mut conn = factory.connect().unwrap();
        let err = conn.stream("SELECT * FROM missing_table", &[], 10).unwrap_err();
        assert!(err.is_transient());

        // Dropping a stream early stops its producer without disturbing the connection
        let mut stream = conn.stream("SELECT * FROM events", &[], 1).unwrap();
        assert!(stream.advance().unwrap());
        drop(stream);
        assert!(conn.is_valid());
    }

    #[test]
    fn test_nanosecond_param_matches_stored_value() {
        let factory = DuckDbFactory::in_memory().unwrap();
        factory
            .execute_batch(
                "CREATE TABLE ns (id BIGINT, ts TIMESTAMP_NS);
                 INSERT INTO ns VALUES (1, TIMESTAMP_NS '2024-01-01 00:00:00.123456789');",
            )
            .unwrap();
        let mut conn = factory.connect().unwrap();

        let mut cursor = conn.query("SELECT ts FROM ns", &[]).unwrap();
        assert!(cursor.advance());
        let stored = cursor.current().and_then(|r| r.get(0)).and_then(SqlValue::as_timestamp).unwrap();

        let (placeholder, param) = timestamp_param(stored);
        let sql = format!("SELECT count(*) FROM ns WHERE ts > {placeholder}");
        let mut cursor = conn.query(&sql, &[param]).unwrap();
        assert!(cursor.advance());
        assert_eq!(cursor.current().unwrap().get(0), Some(&SqlValue::Int(0)));
    }

    #[test]
    fn test_closed_connection() {
        let factory = seeded();
        let mut conn = factory.connect().unwrap();
        assert!(conn.is_valid());
        conn.close().unwrap();
        assert!(!conn.is_valid());
        assert!(conn.query("SELECT 1", &[]).is_err());
    }

    #[test]
    fn test_timestamp_units() {
        let expected = ts("2024-01-01 00:00:00");
        let secs = expected.and_utc().timestamp();
        assert_eq!(timestamp_from_unit(TimeUnit::Second, secs), Some(expected));
        assert_eq!(
            timestamp_from_unit(TimeUnit::Millisecond, secs * 1_000),
            Some(expected)
        );
        assert_eq!(
            timestamp_from_unit(TimeUnit::Nanosecond, secs * 1_000_000_000),
            Some(expected)
        );
        assert_eq!(
            from_duckdb_value(to_duckdb_value(&SqlValue::Timestamp(expected))),
            SqlValue::Timestamp(expected)
        );
        assert_eq!(
            from_duckdb_value(to_duckdb_value(&SqlValue::Date(expected.date()))),
            SqlValue::Date(expected.date())
        );
    }
}
