//! Database access
//!
//! Engine-neutral values and rows, the connection seams, the DuckDB
//! implementation (which also reaches PostgreSQL, MySQL and SQLite through
//! DuckDB extensions), and the cached connection provider used by the task.

mod connection;
mod dialect;
mod duckdb;
mod provider;
mod value;

pub use connection::{ColumnDefinition, Connection, ConnectionFactory};
pub use dialect::{
    escape_string_literal, format_timestamp, quote_identifier, timestamp_param, TableId,
};
pub use duckdb::{DuckDbConnection, DuckDbFactory};
pub use provider::CachedConnectionProvider;
pub use value::{ResultCursor, Row, RowStream, SqlValue};
