//! Source task module
//!
//! The poll loop that drives every querier of one source.
//!
//! # Overview
//!
//! The task module provides:
//! - `SourceTask` - Owns the queriers, the connection provider and the
//!   offset state; `poll` returns the next batch of records
//! - `SourceTaskBuilder` - Validates the config and builds the queriers,
//!   resuming from stored offsets
//! - `QuerierQueue` - Orders queriers by next eligible run time
//! - `Clock` - Injectable time source (`SystemClock`, `ManualClock`)
//! - `StopHandle`, `TaskStats`
//!
//! A single task is never polled concurrently. At most one querier holds
//! the connection at any time, and sleeps are split into short slices so a
//! stop request is seen promptly.

mod clock;
mod queue;
mod types;


pub use clock::{Clock, ManualClock, SystemClock};
pub use queue::QuerierQueue;
pub use types::{StopHandle, TaskStats};

use crate::batch::{BatchIdManager, TableWatermarkStore, TransitionObserver, WatermarkStore};
use crate::config::{Mode, SourceConfig};
use crate::database::{
    CachedConnectionProvider, Connection, ConnectionFactory, DuckDbFactory, TableId,
};
use crate::error::{Error, Result};
use crate::offset::{Offset, TimestampIncrementingCriteria};
use crate::querier::{
    BatchIdQuerier, BulkQuerier, QuerySource, SourceRecord, TableQuerier,
    TimestampIncrementingQuerier,
};
use crate::state::{SourcePartition, StateManager};
use crate::types::QueryMode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Longest uninterrupted sleep of the poll loop
const SLEEP_SLICE_MS: i64 = 100;

// ============================================================================
// Builder
// ============================================================================

/// Builds a [`SourceTask`] from a config
pub struct SourceTaskBuilder {
    config: SourceConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    state: Option<StateManager>,
    clock: Arc<dyn Clock>,
    stop: StopHandle,
    observer: Option<TransitionObserver>,
    watermark_store: Option<Arc<dyn WatermarkStore>>,
}

impl SourceTaskBuilder {
    /// Start building a task for `config`
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            factory: None,
            state: None,
            clock: Arc::new(SystemClock),
            stop: StopHandle::new(),
            observer: None,
            watermark_store: None,
        }
    }

    /// Use this connection factory instead of one built from the config
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Resume from and commit to this state (default: in-memory)
    #[must_use]
    pub fn with_state(mut self, state: StateManager) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a stop flag with the caller
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Report batch offset transitions to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Keep batch watermarks here instead of the `batch.offsets_storage` table
    #[must_use]
    pub fn with_watermark_store(mut self, store: Arc<dyn WatermarkStore>) -> Self {
        self.watermark_store = Some(store);
        self
    }

    /// Validate the config, connect, and build one querier per table or query
    pub async fn start(self) -> Result<SourceTask> {
        let batch_type = self.config.validate()?;

        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DuckDbFactory::new(&self.config.connection)?),
        };
        info!(
            "Starting source task '{}' in {} mode against {}",
            self.config.name,
            self.config.mode,
            factory.describe()
        );

        let mut provider = CachedConnectionProvider::new(
            factory,
            self.config.connection.attempts,
            Duration::from_millis(self.config.connection.backoff_ms),
            self.clock.clone(),
        );
        let state = self.state.unwrap_or_else(StateManager::in_memory);
        let watermark_store = match (&batch_type, self.watermark_store) {
            (Some(_), Some(store)) => Some(store),
            (Some(_), None) => Some(Arc::new(TableWatermarkStore::new(
                &self.config.batch.offsets_storage,
            )?) as Arc<dyn WatermarkStore>),
            (None, _) => None,
        };

        let config = &self.config;
        let delay_ms = config.timestamp_delay_interval_ms;
        let timestamp_columns: Vec<String> = config
            .timestamp_column_name
            .iter()
            .map(|c| c.trim().to_string())
            .collect();
        let incrementing_column = config.incrementing_column().map(str::to_string);

        let mut queue = QuerierQueue::new();
        for table_or_query in config.tables_or_query() {
            let source = match config.query_mode() {
                QueryMode::Table => {
                    let table = TableId::parse(&table_or_query)?;
                    if config.validate_non_null {
                        let conn = provider.get_connection().await?;
                        validate_non_nullable(
                            conn,
                            config.mode,
                            &table,
                            incrementing_column.as_deref(),
                            &timestamp_columns,
                        )?;
                    }
                    QuerySource::Table(table)
                }
                QueryMode::Query => QuerySource::Query(table_or_query),
            };

            let querier: Box<dyn TableQuerier> = match (config.mode, &batch_type) {
                (Mode::Bulk, _) => Box::new(BulkQuerier::new(source, &config.topic_prefix)),
                (Mode::Batch, Some(batch_type)) => {
                    let QuerySource::Table(table) = source else {
                        return Err(Error::invalid_value(
                            "query",
                            "query is not supported in batch mode",
                        ));
                    };
                    let store = watermark_store
                        .clone()
                        .ok_or_else(|| Error::config("batch mode requires a watermark store"))?;
                    let conn = provider.get_connection().await?;
                    let manager = BatchIdManager::load(
                        conn,
                        store,
                        &table,
                        batch_type.clone(),
                        &config.batch,
                    )?
                    .with_observer(self.observer.clone());
                    Box::new(BatchIdQuerier::new(
                        table,
                        &config.topic_prefix,
                        manager,
                        delay_ms,
                    ))
                }
                (Mode::Batch, None) => {
                    return Err(Error::config("batch mode requires a batch type"));
                }
                (mode, _) => {
                    let criteria = match mode {
                        Mode::Incrementing => TimestampIncrementingCriteria::new(
                            Vec::new(),
                            incrementing_column.clone(),
                        ),
                        Mode::Timestamp => {
                            TimestampIncrementingCriteria::new(timestamp_columns.clone(), None)
                        }
                        _ => TimestampIncrementingCriteria::new(
                            timestamp_columns.clone(),
                            incrementing_column.clone(),
                        ),
                    };
                    let offset = stored_offset(&state, &source).await;
                    Box::new(TimestampIncrementingQuerier::new(
                        source,
                        &config.topic_prefix,
                        criteria,
                        offset,
                        delay_ms,
                    ))
                }
            };

            info!(
                "Created {} querier for {} (topic '{}')",
                config.mode,
                querier.name(),
                querier.topic()
            );
            queue.push(querier);
        }

        info!("Started source task '{}' with {} querier(s)", config.name, queue.len());
        Ok(SourceTask {
            config: self.config,
            queue,
            provider,
            state,
            clock: self.clock,
            stop: self.stop,
            stats: TaskStats::new(),
        })
    }
}

/// Offset partitions to probe for a source, newest key shape first
pub fn candidate_partitions(source: &QuerySource) -> Vec<SourcePartition> {
    match source {
        QuerySource::Table(table) => vec![
            SourcePartition::table_v1(table),
            SourcePartition::table_v0(table),
        ],
        QuerySource::Query(_) => vec![SourcePartition::query()],
    }
}

async fn stored_offset(state: &StateManager, source: &QuerySource) -> Option<Offset> {
    let (partition, offset) = state.find_offset(&candidate_partitions(source)).await?;
    info!("Found offset {} for partition {}", offset, partition);
    Some(offset)
}

/// Reject nullable offset columns
///
/// Only the incrementing column of the incrementing modes is checked, and
/// timestamp modes need at least one non-nullable timestamp column.
fn validate_non_nullable(
    conn: &mut dyn Connection,
    mode: Mode,
    table: &TableId,
    incrementing_column: Option<&str>,
    timestamp_columns: &[String],
) -> Result<()> {
    let uses_incrementing = matches!(mode, Mode::Incrementing | Mode::TimestampIncrementing);
    let uses_timestamp = matches!(mode, Mode::Timestamp | Mode::TimestampIncrementing);
    if !uses_incrementing && !uses_timestamp {
        return Ok(());
    }

    let columns = conn.describe_columns(table).map_err(|e| {
        Error::config(format!(
            "failed trying to validate that columns used for offsets are NOT NULL: {e}"
        ))
    })?;

    let mut incrementing_optional = false;
    let mut timestamp_required = false;
    for column in &columns {
        if incrementing_column.is_some_and(|c| c.eq_ignore_ascii_case(&column.name)) {
            incrementing_optional = column.nullable;
        } else if timestamp_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&column.name))
            && !column.nullable
        {
            timestamp_required = true;
        }
    }

    if uses_incrementing && incrementing_optional {
        return Err(Error::config(format!(
            "cannot make incremental queries using incrementing column {} on {} because this \
             column is nullable",
            incrementing_column.unwrap_or_default(),
            table
        )));
    }
    if uses_timestamp && !timestamp_required {
        return Err(Error::config(format!(
            "cannot make incremental queries using timestamp columns [{}] on {} because all of \
             these columns are nullable",
            timestamp_columns.join(", "),
            table
        )));
    }
    Ok(())
}

// ============================================================================
// Task
// ============================================================================

/// Outcome of one scheduling step
enum Step {
    /// Slept towards the head querier's next run time
    Waited,
    /// The head querier's gate deferred its run
    Deferred,
    /// Rows pulled from the head querier, possibly none
    Rows(Vec<SourceRecord>),
}

/// Drives the queriers of one source
pub struct SourceTask {
    config: SourceConfig,
    queue: QuerierQueue,
    provider: CachedConnectionProvider,
    state: StateManager,
    clock: Arc<dyn Clock>,
    stop: StopHandle,
    stats: TaskStats,
}

impl SourceTask {
    /// Start building a task
    pub fn builder(config: SourceConfig) -> SourceTaskBuilder {
        SourceTaskBuilder::new(config)
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    /// Get the offset state
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Handle that stops this task from another task or thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Queriers in configuration order
    pub fn queriers(&self) -> impl Iterator<Item = &dyn TableQuerier> {
        self.queue.iter()
    }

    /// Ask the loop to stop at its next boundary
    pub fn stop(&self) {
        info!("Stopping source task '{}'", self.config.name);
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Return the next non-empty batch of records
    ///
    /// Returns `Ok(None)` when the task was stopped, or when a transient SQL
    /// failure aborted the cycle. In the latter case the querier is rewound
    /// to its offset from before the cycle and requeued, so polling again
    /// retries it. Any other error closes the connection and is returned.
    pub async fn poll(&mut self) -> Result<Option<Vec<SourceRecord>>> {
        trace!("Polling for new data");
        let mut logged_wait = false;

        while !self.stop.is_stopped() {
            let Some(snapshot) = self.queue.head().map(|q| q.current_offset()) else {
                break;
            };

            match self.step(&mut logged_wait).await {
                Ok(Step::Waited | Step::Deferred) => {}
                Ok(Step::Rows(records)) if records.is_empty() => {
                    trace!("No updates for {}", self.head_name());
                }
                Ok(Step::Rows(records)) => {
                    debug!(
                        "Returning {} records for {}",
                        records.len(),
                        records[0].partition
                    );
                    self.stats.add_batch(records.len());
                    return Ok(Some(records));
                }
                Err(e) if e.is_transient() => {
                    error!("Failed to run query for {}: {}", self.head_name(), e);
                    if let Some(querier) = self.queue.head_mut() {
                        querier.restore_offset(snapshot);
                    }
                    self.requeue_head();
                    self.provider.close();
                    self.stats.transient_failures += 1;
                    return Ok(None);
                }
                Err(e) => {
                    error!("Source task '{}' failed: {}", self.config.name, e);
                    self.requeue_head();
                    self.close();
                    return Err(e);
                }
            }
        }

        self.requeue_head();
        self.close();
        Ok(None)
    }

    async fn step(&mut self, logged_wait: &mut bool) -> Result<Step> {
        let poll_interval = self.config.poll_interval_ms as i64;
        let now = self.clock.now_millis();

        let querier = self
            .queue
            .head_mut()
            .ok_or_else(|| Error::config("source task has no queriers"))?;

        if !querier.is_querying() {
            let wait = querier.last_update() + poll_interval - now;
            if wait > 0 {
                if !*logged_wait {
                    debug!("Waiting {} ms to poll {} next", wait, querier.name());
                    *logged_wait = true;
                }
                let slice = wait.min(SLEEP_SLICE_MS) as u64;
                self.clock.sleep(Duration::from_millis(slice)).await;
                return Ok(Step::Waited);
            }

            let conn = self.provider.get_connection().await?;
            if !querier.run_pre_processing(conn)? {
                info!("{} is not ready to run, deferring", querier.name());
                self.stats.deferred_runs += 1;
                self.requeue_head();
                self.clock
                    .sleep(Duration::from_millis(SLEEP_SLICE_MS as u64))
                    .await;
                return Ok(Step::Deferred);
            }
        }

        debug!("Checking for next block of results from {}", querier.name());
        let conn = self.provider.get_connection().await?;
        querier.start_query_if_needed(conn, self.clock.now())?;

        let max_rows = self.config.batch_max_rows;
        let mut records = Vec::new();
        let mut exhausted = false;
        while records.len() < max_rows {
            if !querier.next()? {
                exhausted = true;
                break;
            }
            records.push(querier.extract_record()?);
        }

        if exhausted {
            let completed = querier.run_post_processing(conn)?;
            if !completed {
                debug!("Run of {} stays pending", querier.name());
            }
            self.stats.add_run(completed);
            self.requeue_head();
        }

        Ok(Step::Rows(records))
    }

    fn head_name(&self) -> String {
        self.queue
            .head()
            .map(|q| q.name().to_string())
            .unwrap_or_default()
    }

    fn requeue_head(&mut self) {
        let now = self.clock.now_millis();
        if let Some(querier) = self.queue.head() {
            debug!("Resetting querier {}", querier.name());
        }
        self.queue.requeue_head(now);
    }

    /// Store the current offset of every offset-tracking querier
    ///
    /// Call after the records returned by `poll` have been delivered. Batch
    /// queriers are skipped: their progress lives in the watermark store.
    /// Returns the number of offsets written.
    pub async fn commit_offsets(&self) -> Result<usize> {
        let offsets: Vec<(SourcePartition, Offset)> = self
            .queue
            .iter()
            .filter(|q| q.persists_offset())
            .map(|q| (q.partition().clone(), q.current_offset()))
            .filter(|(_, offset)| !offset.is_empty())
            .collect();

        let count = offsets.len();
        if count > 0 {
            self.state.set_offsets(offsets).await?;
            debug!("Committed {} offset(s)", count);
        }
        Ok(count)
    }

    /// Release the connection
    pub fn close(&mut self) {
        info!("Closing resources for source task '{}'", self.config.name);
        self.provider.close();
    }
}

impl std::fmt::Debug for SourceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTask")
            .field("name", &self.config.name)
            .field("queue", &self.queue)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
