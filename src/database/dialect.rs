//! Table identifiers and quoting

use super::value::SqlValue;
use crate::error::{Error, Result};
use chrono::{NaiveDateTime, Timelike};

/// Literal format used when timestamps are spliced into SQL text
///
/// Fractional seconds are printed only when present, at 3, 6 or 9 digits.
pub const TIMESTAMP_LITERAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Text form of a timestamp bound at nanosecond precision
const NANOS_PARAM_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Quote an identifier with double quotes, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a value for use inside a single-quoted SQL string
pub fn escape_string_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Format a timestamp as a SQL literal body (without quotes)
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_LITERAL_FORMAT).to_string()
}

/// Placeholder and parameter for comparing against `ts`
///
/// Timestamp parameters are bound at microsecond precision. A value with
/// sub-microsecond digits is sent as text and cast to `TIMESTAMP_NS`
/// instead, so an offset read from a nanosecond column compares equal to
/// the row it came from.
pub fn timestamp_param(ts: NaiveDateTime) -> (&'static str, SqlValue) {
    if ts.nanosecond() % 1_000 == 0 {
        ("?", SqlValue::Timestamp(ts))
    } else {
        (
            "CAST(? AS TIMESTAMP_NS)",
            SqlValue::Text(ts.format(NANOS_PARAM_FORMAT).to_string()),
        )
    }
}

/// A possibly schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    /// Schema, if given
    pub schema: Option<String>,
    /// Table name
    pub table: String,
}

impl TableId {
    /// Create a table id
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.map(String::from),
            table: table.into(),
        }
    }

    /// Parse `table`, `schema.table` or their double-quoted forms
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut chars = name.trim().chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes && chars.peek() == Some(&'"') => {
                    current.push('"');
                    chars.next();
                }
                '"' => in_quotes = !in_quotes,
                '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        if in_quotes {
            return Err(Error::invalid_value(
                "tables",
                format!("unterminated quote in table name '{name}'"),
            ));
        }
        parts.push(current);

        if parts.iter().any(String::is_empty) {
            return Err(Error::invalid_value(
                "tables",
                format!("invalid table name '{name}'"),
            ));
        }

        // Catalog qualifiers are dropped, the connection already selects one
        let table = parts.pop().unwrap_or_default();
        let schema = parts.pop();
        Ok(Self { schema, table })
    }

    /// Quoted form usable in a FROM clause
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.table)),
            None => quote_identifier(&self.table),
        }
    }

    /// Unquoted `schema.table`, or just `table` when unqualified
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}
