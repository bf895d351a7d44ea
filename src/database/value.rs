//! SQL values, rows and result cursors
//!
//! Rows are engine-neutral: every backend converts its native values into
//! [`SqlValue`] so queriers and the offset model never see driver types.

use crate::error::Result;
use crate::types::JsonValue;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// A single SQL value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type that fits in 64 bits
    Int(i64),
    /// Floating point or decimal
    Double(f64),
    /// Character data
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Calendar date
    Date(NaiveDate),
    /// Timestamp without time zone (UTC)
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    /// Whether this is SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view of the value, if it is integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Timestamp view of the value; dates are taken at midnight
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(ts) => Some(*ts),
            SqlValue::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Short type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int(_) => "integer",
            SqlValue::Double(_) => "double",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Date(_) => "date",
            SqlValue::Timestamp(_) => "timestamp",
        }
    }

    /// Convert to JSON for record output
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(b) => JsonValue::Bool(*b),
            SqlValue::Int(i) => JsonValue::Number((*i).into()),
            SqlValue::Double(f) => {
                serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number)
            }
            SqlValue::Text(s) => JsonValue::String(s.clone()),
            SqlValue::Bytes(b) => JsonValue::String(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b,
            )),
            SqlValue::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(ts) => {
                JsonValue::String(ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

/// One result row; column names are shared across the rows of a result
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row from shared column names and values
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in result order
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Value by position
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value by column name, ignoring case
    pub fn get_by_name(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Render the row as a JSON object keyed by column name
    pub fn to_json(&self) -> JsonValue {
        let object = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect();
        JsonValue::Object(object)
    }
}

/// Forward-only cursor over the rows of an executed query
///
/// `advance` must be called before the first `current`.
#[derive(Debug, Default)]
pub struct ResultCursor {
    pending: VecDeque<Row>,
    current: Option<Row>,
}

impl ResultCursor {
    /// Create a cursor over already fetched rows
    pub fn new(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            pending: rows.into_iter().collect(),
            current: None,
        }
    }

    /// Move to the next row; false once exhausted
    pub fn advance(&mut self) -> bool {
        self.current = self.pending.pop_front();
        self.current.is_some()
    }

    /// Row the cursor is positioned on
    pub fn current(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    /// Rows not yet reached
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Consume the cursor, returning the rows not yet reached
    pub fn into_rows(self) -> Vec<Row> {
        self.current.into_iter().chain(self.pending).collect()
    }
}

/// Rows handed over one page at a time by a producer
///
/// Only the current page is held here. The producer fills the next page
/// while this one is consumed and stops once the stream is dropped.
#[derive(Debug, Default)]
pub struct RowStream {
    page: ResultCursor,
    pages: Option<Receiver<Result<Vec<Row>>>>,
}

impl RowStream {
    /// Wait for the first page, so a failing statement errors here
    pub fn open(pages: Receiver<Result<Vec<Row>>>) -> Result<Self> {
        let mut stream = Self {
            page: ResultCursor::default(),
            pages: Some(pages),
        };
        stream.next_page()?;
        Ok(stream)
    }

    fn next_page(&mut self) -> Result<bool> {
        let Some(pages) = &self.pages else {
            return Ok(false);
        };
        match pages.recv() {
            Ok(Ok(rows)) => {
                self.page = ResultCursor::new(rows);
                Ok(true)
            }
            Ok(Err(e)) => {
                self.pages = None;
                Err(e)
            }
            // Producer finished
            Err(_) => {
                self.pages = None;
                Ok(false)
            }
        }
    }

    /// Move to the next row, pulling the next page when needed
    pub fn advance(&mut self) -> Result<bool> {
        while !self.page.advance() {
            if !self.next_page()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Row the stream is positioned on
    pub fn current(&self) -> Option<&Row> {
        self.page.current()
    }

    /// Rows of the current page not yet reached
    pub fn buffered(&self) -> usize {
        self.page.remaining()
    }
}

impl From<ResultCursor> for RowStream {
    fn from(page: ResultCursor) -> Self {
        Self { page, pages: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    fn row(id: i64, name: &str) -> Row {
        let columns: Arc<[String]> = vec!["ID".to_string(), "name".to_string()].into();
        Row::new(columns, vec![SqlValue::Int(id), SqlValue::from(name)])
    }

    #[test]
    fn test_get_by_name_ignores_case() {
        let row = row(1, "a");
        assert_eq!(row.get_by_name("id"), Some(&SqlValue::Int(1)));
        assert_eq!(row.get_by_name("NAME"), Some(&SqlValue::from("a")));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_value_views() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(SqlValue::Timestamp(ts).as_timestamp(), Some(ts));
        assert_eq!(
            SqlValue::Date(ts.date()).as_timestamp(),
            ts.date().and_hms_opt(0, 0, 0)
        );
        assert_eq!(SqlValue::Int(3).as_i64(), Some(3));
        assert_eq!(SqlValue::Text("3".into()).as_i64(), None);
        assert!(SqlValue::Null.is_null());
    }

    #[test]
    fn test_row_to_json() {
        assert_eq!(
            row(7, "x").to_json(),
            serde_json::json!({"ID": 7, "name": "x"})
        );

        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            SqlValue::Timestamp(ts).to_json(),
            serde_json::json!("2024-01-01T00:00:00.000000Z")
        );
        assert_eq!(SqlValue::Bytes(b"hi".to_vec()).to_json(), serde_json::json!("aGk="));
    }

    #[test]
    fn test_cursor_advance() {
        let mut cursor = ResultCursor::new(vec![row(1, "a"), row(2, "b")]);
        assert!(cursor.current().is_none());
        assert!(cursor.advance());
        assert_eq!(cursor.current().unwrap().get(0), Some(&SqlValue::Int(1)));
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.advance());
        assert!(!cursor.advance());
        assert!(cursor.current().is_none());
    }

    #[test]
    fn test_row_stream_pulls_pages_on_demand() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        tx.send(Ok(vec![row(1, "a"), row(2, "b")])).unwrap();
        let mut stream = RowStream::open(rx).unwrap();
        tx.send(Ok(vec![row(3, "c")])).unwrap();
        drop(tx);

        assert!(stream.advance().unwrap());
        assert_eq!(stream.buffered(), 1);
        assert!(stream.advance().unwrap());
        assert!(stream.advance().unwrap());
        assert_eq!(stream.current().unwrap().get(0), Some(&SqlValue::Int(3)));
        assert!(!stream.advance().unwrap());
        assert!(!stream.advance().unwrap());
    }

    #[test]
    fn test_row_stream_surfaces_producer_errors() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        tx.send(Err(Error::sql("boom"))).unwrap();
        assert!(RowStream::open(rx).unwrap_err().is_transient());

        let (tx, rx) = std::sync::mpsc::sync_channel(2);
        tx.send(Ok(vec![row(1, "a")])).unwrap();
        tx.send(Err(Error::sql("lost connection"))).unwrap();
        let mut stream = RowStream::open(rx).unwrap();
        assert!(stream.advance().unwrap());
        assert!(stream.advance().is_err());
        assert!(!stream.advance().unwrap());
    }
}
