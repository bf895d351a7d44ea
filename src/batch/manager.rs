//! Batch watermark manager
//!
//! Drives the batch run state machine of one table:
//!
//! ```text
//! Idle -> GateCheck -> Running -> Committing -> Idle
//!            |  ^
//!            +--+  gate returned no row: defer
//! ```
//!
//! The gating query resolves the run's upper bound (`run_to`). A run is only
//! committed when the last extracted offset equals `run_to` exactly, so the
//! stored `last` watermark never passes a bound that was not fully consumed.

use super::store::WatermarkStore;
use super::types::{
    BatchOffset, BatchRunState, BatchType, OffsetTransition, TransitionObserver, Watermark,
};
use crate::config::BatchConfig;
use crate::database::{escape_string_literal, Connection, SqlValue, TableId};
use crate::error::{Error, Result};
use crate::offset::Offset;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Placeholder replaced by the quoted `schema.table` name
pub const TABLE_NAME_PLACEHOLDER: &str = "__TABLE_NAME__";
/// Placeholder replaced by the last committed offset
pub const OFFSET_PLACEHOLDER: &str = "__OFFSET__";

const UPPER_BOUND_NOT_FOUND: &str = "from watermark table does not exist in the source table";

/// Tracks, validates and persists the watermark of one batch table
pub struct BatchIdManager {
    table: String,
    batch_type: BatchType,
    watermark: Watermark,
    gate_query: String,
    state: BatchRunState,
    store: Arc<dyn WatermarkStore>,
    observer: Option<TransitionObserver>,
}

impl std::fmt::Debug for BatchIdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchIdManager")
            .field("table", &self.table)
            .field("batch_type", &self.batch_type)
            .field("watermark", &self.watermark)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl BatchIdManager {
    /// Load the table's watermark, initialising it from the configured
    /// default start when the store has none
    pub fn load(
        conn: &mut dyn Connection,
        store: Arc<dyn WatermarkStore>,
        table: &TableId,
        batch_type: BatchType,
        config: &BatchConfig,
    ) -> Result<Self> {
        let name = table.qualified_name();
        let default_start = batch_type.parse_start(&config.default_offset_start)?;

        let watermark = match store.load(conn, &name)? {
            Some(record) => {
                let watermark = Watermark::from_record(&record, default_start);
                info!(
                    "Loaded watermark for {} from {}: start={}, last={}",
                    name,
                    store.describe(),
                    watermark.start(),
                    watermark.last()
                );
                watermark
            }
            None => {
                let watermark = Watermark::starting_at(default_start);
                store.save(conn, &name, &watermark.to_record())?;
                info!(
                    "Initialised watermark for {} in {} at {}",
                    name,
                    store.describe(),
                    default_start
                );
                watermark
            }
        };

        Ok(Self {
            table: name,
            batch_type,
            watermark,
            gate_query: config.pre_run_check_query.trim().to_string(),
            state: BatchRunState::Idle,
            store,
            observer: None,
        })
    }

    /// Attach an observer for offset transitions
    #[must_use]
    pub fn with_observer(mut self, observer: Option<TransitionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// `schema.table` this manager tracks
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn batch_type(&self) -> &BatchType {
        &self.batch_type
    }

    pub fn state(&self) -> BatchRunState {
        self.state
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn start_offset(&self) -> BatchOffset {
        self.watermark.start()
    }

    pub fn last_offset(&self) -> BatchOffset {
        self.watermark.last()
    }

    pub fn run_to(&self) -> Option<BatchOffset> {
        self.watermark.run_to()
    }

    /// Whether a gating query is configured
    pub fn is_gated(&self) -> bool {
        !self.gate_query.is_empty()
    }

    /// Whether a resolved run has not been committed yet
    pub fn is_run_pending(&self) -> bool {
        self.run_to().is_some()
    }

    /// Gating query with placeholders substituted, or `None` when ungated
    pub fn render_gate_query(&self) -> Option<String> {
        if !self.is_gated() {
            return None;
        }
        let table = format!("'{}'", escape_string_literal(&self.table));
        Some(
            self.gate_query
                .replace(TABLE_NAME_PLACEHOLDER, &table)
                .replace(OFFSET_PLACEHOLDER, &self.last_offset().sql_literal()),
        )
    }

    /// Decide whether a run may start
    ///
    /// Returns `false` when the gate yields no row (or NULL): the caller
    /// should defer. An upper bound of the wrong type or below the committed
    /// watermark is a fatal [`Error::Watermark`].
    pub fn check_pre_run(&mut self, conn: &mut dyn Connection) -> Result<bool> {
        let Some(sql) = self.render_gate_query() else {
            self.state = BatchRunState::Running;
            return Ok(true);
        };

        if self.is_run_pending() {
            self.state = BatchRunState::Running;
            return Ok(true);
        }

        self.state = BatchRunState::GateCheck;
        info!("Pre-run query for {}: {}", self.table, sql);

        let mut cursor = conn.query(&sql, &[])?;
        let value = if cursor.advance() {
            cursor.current().and_then(|row| row.get(0)).cloned()
        } else {
            None
        };

        let value = match value {
            None | Some(SqlValue::Null) => {
                info!("Pre-run query for {} is not returning any data", self.table);
                return Ok(false);
            }
            Some(value) => value,
        };

        let run_to = self.resolve_run_to(&value)?;
        self.watermark.set_run_to(run_to);
        self.state = BatchRunState::Running;
        info!(
            "Batch run for {} resolved: {} -> {}",
            self.table,
            self.last_offset(),
            run_to
        );
        Ok(true)
    }

    fn resolve_run_to(&self, value: &SqlValue) -> Result<BatchOffset> {
        let run_to = self.batch_type.value_from_sql(value).ok_or_else(|| {
            Error::watermark(
                &self.table,
                format!(
                    "upper bound of type {} {UPPER_BOUND_NOT_FOUND}",
                    value.type_name()
                ),
            )
        })?;

        let below = |bound: BatchOffset| run_to.compare(&bound) == Some(Ordering::Less);
        if below(self.start_offset()) || below(self.last_offset()) {
            return Err(Error::watermark(
                &self.table,
                format!(
                    "upper bound '{run_to}' {UPPER_BOUND_NOT_FOUND} (start={}, last={})",
                    self.start_offset(),
                    self.last_offset()
                ),
            ));
        }

        Ok(run_to)
    }

    /// Note a per-row offset change of the querier
    pub fn record_transition(&self, old: &Offset, new: &Offset) {
        let Some(new) = self.batch_type.offset_value(new) else {
            return;
        };
        let old = self.batch_type.offset_value(old);
        if old == Some(new) {
            return;
        }

        trace!(
            "Offset transition for {}: {} -> {}",
            self.table,
            old.map_or_else(|| "<none>".to_string(), |o| o.to_string()),
            new
        );
        if let Some(observer) = &self.observer {
            observer(&OffsetTransition {
                table: self.table.clone(),
                old,
                new,
            });
        }
    }

    /// Complete the run if `extracted` reached its upper bound
    ///
    /// Returns `true` when the run is finished. A shortfall keeps `run_to`
    /// pending and returns `false`. Without a gating query the consumed
    /// offset is committed whenever it moved forward.
    pub fn commit(&mut self, conn: &mut dyn Connection, extracted: &Offset) -> Result<bool> {
        self.state = BatchRunState::Committing;
        let extracted = self.batch_type.offset_value(extracted);

        let target = match (self.run_to(), extracted) {
            (Some(run_to), Some(value)) if run_to == value => Some(run_to),
            (Some(run_to), _) => {
                warn!(
                    "Batch run for {} is incomplete: last extracted offset {} has not reached \
                     run-to offset {}, commit skipped",
                    self.table,
                    extracted.map_or_else(|| "<none>".to_string(), |o| o.to_string()),
                    run_to
                );
                self.state = BatchRunState::Idle;
                return Ok(false);
            }
            (None, _) if self.is_gated() => {
                debug!("No batch run pending for {}", self.table);
                self.state = BatchRunState::Idle;
                return Ok(false);
            }
            (None, Some(value))
                if value.compare(&self.last_offset()) == Some(Ordering::Greater) =>
            {
                Some(value)
            }
            (None, _) => None,
        };

        if let Some(target) = target {
            let mut next = self.watermark;
            next.complete(target);
            self.store.save(conn, &self.table, &next.to_record())?;
            self.watermark = next;
            info!("Committed watermark for {}: last={}", self.table, target);
        }

        self.state = BatchRunState::Idle;
        Ok(true)
    }
}
