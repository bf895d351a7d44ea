//! CLI runner - executes commands

use crate::batch::{TableWatermarkStore, WatermarkStore};
use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::{Mode, SourceConfig};
use crate::database::{format_timestamp, Connection, ConnectionFactory, DuckDbFactory, TableId};
use crate::error::{Error, Result, ResultExt};
use crate::output::{records_to_arrow, write_batch_to_parquet, ParquetWriterConfig};
use crate::querier::SourceRecord;
use crate::state::StateManager;
use crate::task::{SourceTask, StopHandle};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Validate => self.validate(),
            Commands::Check => self.check().await,
            Commands::Run {
                output,
                max_batches,
                compression,
            } => {
                self.run_source(output.as_deref(), *max_batches, compression)
                    .await
            }
            Commands::Offsets => self.offsets().await,
        }
    }

    /// Load the source configuration
    fn load_config(&self) -> Result<SourceConfig> {
        let path = self
            .cli
            .config
            .as_ref()
            .ok_or_else(|| Error::config("Config file not specified (use -C flag)"))?;
        SourceConfig::from_file(path)
    }

    /// Load state
    fn load_state(&self) -> Result<StateManager> {
        if let Some(path) = &self.cli.state {
            StateManager::from_file(path)
        } else {
            Ok(StateManager::in_memory())
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        let config = self.load_config()?;

        match config.validate() {
            Ok(batch_type) => {
                self.output_message(&json!({
                    "type": "VALIDATION",
                    "validation": {
                        "status": "SUCCEEDED",
                        "name": config.name,
                        "mode": config.mode.to_string(),
                        "sources": config.tables_or_query(),
                        "batch_type": batch_type.map(|t| t.to_string()),
                    }
                }));
                Ok(())
            }
            Err(e) => {
                self.output_message(&json!({
                    "type": "VALIDATION",
                    "validation": {
                        "status": "FAILED",
                        "message": e.to_string(),
                    }
                }));
                Err(e)
            }
        }
    }

    /// Check connection and column setup
    async fn check(&self) -> Result<()> {
        let config = self.load_config()?;
        config.validate()?;

        let factory = DuckDbFactory::new(&config.connection)?;
        info!("Checking connection to {}", factory.describe());

        let probe = factory.connect().and_then(|mut conn| {
            let valid = conn.is_valid();
            conn.close()?;
            if valid {
                Ok(())
            } else {
                Err(Error::sql("connection is not valid"))
            }
        });

        // Starting a task also checks the offset columns of every table
        let status = match probe {
            Ok(()) => SourceTask::builder(config).start().await.map(|mut task| {
                let count = task.queriers().count();
                task.close();
                count
            }),
            Err(e) => Err(e),
        };

        match status {
            Ok(queriers) => {
                self.output_message(&json!({
                    "type": "CONNECTION_STATUS",
                    "connectionStatus": {
                        "status": "SUCCEEDED",
                        "message": format!("Connection successful, {queriers} querier(s) ready")
                    }
                }));
            }
            Err(e) => {
                self.output_message(&json!({
                    "type": "CONNECTION_STATUS",
                    "connectionStatus": {
                        "status": "FAILED",
                        "message": format!("Connection failed: {e}")
                    }
                }));
            }
        }

        Ok(())
    }

    /// Poll the source until stopped or `max_batches` batches were emitted
    async fn run_source(
        &self,
        output: Option<&Path>,
        max_batches: Option<usize>,
        compression: &str,
    ) -> Result<()> {
        let config = self.load_config()?;
        let state = self.load_state()?;
        let parquet_config = ParquetWriterConfig::new().with_compression_name(compression)?;

        if matches!(self.cli.format, OutputFormat::Parquet) && output.is_none() {
            return Err(Error::config("Parquet format requires --output directory"));
        }
        if let Some(dir) = output {
            std::fs::create_dir_all(dir).context("Failed to create output directory")?;
        }

        let stop = StopHandle::new();
        let mut task = SourceTask::builder(config)
            .with_state(state)
            .with_stop_handle(stop.clone())
            .start()
            .await?;
        stop_on_ctrl_c(stop);

        let started = Instant::now();
        let mut batches = 0usize;

        while max_batches.map_or(true, |max| batches < max) {
            match task.poll().await? {
                Some(records) => {
                    batches += 1;
                    self.emit_records(&records, output, batches, &parquet_config)?;
                    task.commit_offsets().await?;
                    self.output_message(&json!({
                        "type": "STATE",
                        "state": task.state().snapshot().await,
                    }));
                }
                None if task.is_stopped() => break,
                None => debug!("Poll returned no records, retrying"),
            }
        }

        task.close();
        let elapsed = started.elapsed();
        info!(
            "Emitted {} batch(es), {} record(s) in {:.2}s",
            batches,
            task.stats().records,
            elapsed.as_secs_f64()
        );
        self.output_message(&json!({
            "type": "SUMMARY",
            "summary": {
                "batches": batches,
                "elapsed_ms": elapsed.as_millis() as u64,
                "stats": task.stats(),
            }
        }));

        Ok(())
    }

    /// Print stored offsets, and batch watermarks when a batch config is given
    async fn offsets(&self) -> Result<()> {
        let state = self.load_state()?;
        self.output_message(&json!({
            "type": "STATE",
            "state": state.snapshot().await,
        }));

        let Some(config) = self.cli.config.as_ref().map(SourceConfig::from_file).transpose()?
        else {
            return Ok(());
        };
        if config.mode != Mode::Batch {
            return Ok(());
        }

        let factory = DuckDbFactory::new(&config.connection)?;
        let store = TableWatermarkStore::new(&config.batch.offsets_storage)?;
        let mut conn = factory.connect()?;
        for table in &config.tables {
            let name = TableId::parse(table)?.qualified_name();
            let watermark = watermark_json(&store, conn.as_mut(), &name)?;
            self.output_message(&json!({
                "type": "WATERMARK",
                "watermark": watermark,
            }));
        }
        if let Err(e) = conn.close() {
            warn!("Failed to close connection: {}", e);
        }

        Ok(())
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Emit one polled batch
    ///
    /// Parquet files are written per topic as `{topic}-{batch}.parquet` when
    /// an output directory is given; records go to stdout unless the format
    /// is Parquet.
    fn emit_records(
        &self,
        records: &[SourceRecord],
        output: Option<&Path>,
        batch: usize,
        parquet_config: &ParquetWriterConfig,
    ) -> Result<()> {
        if let Some(dir) = output {
            for group in records.chunk_by(|a, b| a.topic == b.topic) {
                let path = dir.join(format!("{}-{batch:06}.parquet", group[0].topic));
                let arrow_batch = records_to_arrow(group, None)?;
                let rows = write_batch_to_parquet(&path, &arrow_batch, Some(parquet_config))?;
                info!("Wrote {} row(s) to {}", rows, path.display());
            }
        }

        if matches!(self.cli.format, OutputFormat::Parquet) {
            return Ok(());
        }

        let emitted_at = chrono::Utc::now().timestamp_millis();
        for record in records {
            self.output_message(&json!({
                "type": "RECORD",
                "record": record.to_json(),
                "emitted_at": emitted_at,
            }));
        }
        Ok(())
    }

    /// Output a message
    fn output_message(&self, msg: &Value) {
        match self.cli.format {
            OutputFormat::Json | OutputFormat::Parquet => {
                println!("{}", serde_json::to_string(msg).unwrap_or_default());
            }
            OutputFormat::Pretty => {
                println!("{}", serde_json::to_string_pretty(msg).unwrap_or_default());
            }
        }
    }
}

/// Stop the task at its next loop boundary on Ctrl-C
fn stop_on_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping");
            stop.stop();
        }
    });
}

fn watermark_json(
    store: &TableWatermarkStore,
    conn: &mut dyn Connection,
    table: &str,
) -> Result<Value> {
    let Some(record) = store.load(conn, table)? else {
        return Ok(json!({ "table": table, "stored": false }));
    };
    Ok(json!({
        "table": table,
        "stored": true,
        "start_offset_ts": record.start_offset_ts.as_ref().map(format_timestamp),
        "start_offset_long": record.start_offset_long,
        "last_offset_ts": record.last_offset_ts.as_ref().map(format_timestamp),
        "last_offset_long": record.last_offset_long,
    }))
}
