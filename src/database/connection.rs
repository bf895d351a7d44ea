//! Connection seams
//!
//! The task only talks to the database through these traits, so tests can
//! inject failing or scripted connections.

use super::dialect::TableId;
use super::value::{ResultCursor, RowStream, SqlValue};
use crate::error::Result;

/// Column metadata used for startup validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Column name as reported by the database
    pub name: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
}

/// A live database connection
///
/// Statement failures are reported as [`crate::Error::Sql`].
pub trait Connection: Send {
    /// Run a query with positional `?` parameters
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultCursor>;

    /// Run a query whose rows are handed over `fetch_size` at a time
    ///
    /// Connections without streaming support return the whole result as a
    /// single page.
    fn stream(&mut self, sql: &str, params: &[SqlValue], _fetch_size: usize) -> Result<RowStream> {
        self.query(sql, params).map(RowStream::from)
    }

    /// Run a statement, returning the number of affected rows
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Lightweight round-trip to check the connection is usable
    fn is_valid(&mut self) -> bool;

    /// Column metadata for a table
    fn describe_columns(&mut self, table: &TableId) -> Result<Vec<ColumnDefinition>>;

    /// Release the connection
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens new connections
pub trait ConnectionFactory: Send + Sync {
    /// Open and initialise a new connection
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Human readable target, safe for logs
    fn describe(&self) -> String;
}
