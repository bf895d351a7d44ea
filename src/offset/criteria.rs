//! Offset predicates, extraction and ordering
//!
//! [`TimestampIncrementingCriteria`] knows which columns make up an offset.
//! It renders the `WHERE ... ORDER BY ...` tail of a query for a starting
//! offset, pulls the offset out of a result row, and orders offsets.

use super::types::Offset;
use crate::database::{quote_identifier, timestamp_param, Row, SqlValue};
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use std::cmp::Ordering;

/// Upper bounds applied to an offset predicate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryBounds {
    /// Inclusive upper bound on the timestamp expression
    pub end_timestamp: Option<NaiveDateTime>,
    /// Inclusive upper bound on the incrementing column
    pub max_incrementing: Option<i64>,
}

/// A rendered predicate plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetPredicate {
    /// SQL tail starting with a space, empty when nothing is filtered
    pub clause: String,
    /// Parameters in placeholder order
    pub params: Vec<SqlValue>,
}

/// Offset columns for one querier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampIncrementingCriteria {
    timestamp_columns: Vec<String>,
    incrementing_column: Option<String>,
}

impl TimestampIncrementingCriteria {
    /// Create criteria; either part may be empty
    pub fn new(timestamp_columns: Vec<String>, incrementing_column: Option<String>) -> Self {
        Self {
            timestamp_columns,
            incrementing_column,
        }
    }

    /// Criteria over a single incrementing column
    pub fn incrementing(column: impl Into<String>) -> Self {
        Self::new(Vec::new(), Some(column.into()))
    }

    /// Criteria over one or more timestamp columns
    pub fn timestamp(columns: Vec<String>) -> Self {
        Self::new(columns, None)
    }

    pub fn has_timestamp(&self) -> bool {
        !self.timestamp_columns.is_empty()
    }

    pub fn has_incrementing(&self) -> bool {
        self.incrementing_column.is_some()
    }

    pub fn timestamp_columns(&self) -> &[String] {
        &self.timestamp_columns
    }

    pub fn incrementing_column(&self) -> Option<&str> {
        self.incrementing_column.as_deref()
    }

    fn timestamp_expression(&self) -> String {
        match self.timestamp_columns.as_slice() {
            [single] => quote_identifier(single),
            columns => {
                let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
                format!("COALESCE({})", quoted.join(", "))
            }
        }
    }

    /// Render the predicate selecting rows strictly newer than `offset`
    pub fn predicate(&self, offset: &Offset, bounds: &QueryBounds) -> OffsetPredicate {
        let mut params = Vec::new();
        let clause = match (self.has_timestamp(), &self.incrementing_column) {
            (true, Some(incrementing)) => {
                let ts = self.timestamp_expression();
                let inc = quote_identifier(incrementing);
                let (last, last_param) = timestamp_param(offset.timestamp_or_epoch());

                let mut clause = String::from(" WHERE ");
                if let Some(end) = bounds.end_timestamp {
                    let (placeholder, param) = timestamp_param(end);
                    clause.push_str(&format!("{ts} <= {placeholder} AND "));
                    params.push(param);
                }
                clause.push_str(&format!(
                    "(({ts} = {last} AND {inc} > ?) OR {ts} > {last}) ORDER BY {ts} ASC, {inc} ASC"
                ));
                params.push(last_param.clone());
                params.push(SqlValue::Int(offset.incrementing_or_default()));
                params.push(last_param);
                clause
            }
            (true, None) => {
                let ts = self.timestamp_expression();
                let (last, last_param) = timestamp_param(offset.timestamp_or_epoch());
                let mut clause = format!(" WHERE {ts} > {last}");
                params.push(last_param);
                if let Some(end) = bounds.end_timestamp {
                    let (placeholder, param) = timestamp_param(end);
                    clause.push_str(&format!(" AND {ts} <= {placeholder}"));
                    params.push(param);
                }
                clause.push_str(&format!(" ORDER BY {ts} ASC"));
                clause
            }
            (false, Some(incrementing)) => {
                let inc = quote_identifier(incrementing);
                let mut clause = format!(" WHERE {inc} > ?");
                params.push(SqlValue::Int(offset.incrementing_or_default()));
                if let Some(max) = bounds.max_incrementing {
                    clause.push_str(&format!(" AND {inc} <= ?"));
                    params.push(SqlValue::Int(max));
                }
                clause.push_str(&format!(" ORDER BY {inc} ASC"));
                clause
            }
            (false, None) => String::new(),
        };

        OffsetPredicate { clause, params }
    }

    /// Read the configured offset columns from a row
    ///
    /// The timestamp is the first non-null configured timestamp column and
    /// stays unset when all of them are null. A null incrementing value is
    /// an error.
    pub fn extract(&self, row: &Row) -> Result<Offset> {
        let mut offset = Offset::default();

        for column in &self.timestamp_columns {
            let value = row
                .get_by_name(column)
                .ok_or_else(|| Error::data(format!("timestamp column '{column}' not found in row")))?;
            if value.is_null() {
                continue;
            }
            let ts = value.as_timestamp().ok_or_else(|| {
                Error::data(format!(
                    "timestamp column '{column}' has incompatible type {}",
                    value.type_name()
                ))
            })?;
            offset.timestamp = Some(ts);
            break;
        }

        if let Some(column) = &self.incrementing_column {
            let value = row.get_by_name(column).ok_or_else(|| {
                Error::data(format!("incrementing column '{column}' not found in row"))
            })?;
            offset.incrementing = Some(incrementing_value(column, value)?);
        }

        Ok(offset)
    }

    /// Order two offsets on the configured columns, timestamp first
    pub fn compare(&self, a: &Offset, b: &Offset) -> Ordering {
        let by_timestamp = if self.has_timestamp() {
            a.timestamp.cmp(&b.timestamp)
        } else {
            Ordering::Equal
        };
        let by_incrementing = if self.has_incrementing() {
            a.incrementing.cmp(&b.incrementing)
        } else {
            Ordering::Equal
        };
        by_timestamp.then(by_incrementing)
    }

    /// The greater of `current` and the offset extracted from `row`
    pub fn advance(&self, current: &Offset, row: &Row) -> Result<Offset> {
        let extracted = self.extract(row)?;
        if self.compare(&extracted, current) == Ordering::Greater {
            Ok(extracted)
        } else {
            Ok(*current)
        }
    }
}

fn incrementing_value(column: &str, value: &SqlValue) -> Result<i64> {
    match value {
        SqlValue::Int(i) => Ok(*i),
        SqlValue::Double(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => Ok(*f as i64),
        SqlValue::Null => Err(Error::data(format!(
            "null value for incrementing column '{column}'"
        ))),
        other => Err(Error::data(format!(
            "incrementing column '{column}' has incompatible type {}",
            other.type_name()
        ))),
    }
}
