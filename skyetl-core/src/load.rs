//! Load stage: chunked writes of a batch into a sink table.
//!
//! The first committed chunk replaces the table, every later chunk appends.
//! What happens after a failed chunk is decided by [`LoadPolicy`].

use crate::data::batch::{Batch, Chunk};
use crate::error::{EtlError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::sink::{Sink, WriteMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

const STAGING_SUFFIX: &str = "__staging";

/// Behaviour after a chunk write fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Abort the remaining chunks; committed chunks stay.
    #[default]
    StopOnError,
    /// Keep writing later chunks and report every failed ordinal.
    BestEffort,
    /// Write into a staging table and swap it in only if every chunk succeeded.
    AllOrNothing,
}

impl fmt::Display for LoadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadPolicy::StopOnError => write!(f, "stop_on_error"),
            LoadPolicy::BestEffort => write!(f, "best_effort"),
            LoadPolicy::AllOrNothing => write!(f, "all_or_nothing"),
        }
    }
}

impl std::str::FromStr for LoadPolicy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "stop_on_error" => Ok(LoadPolicy::StopOnError),
            "best_effort" => Ok(LoadPolicy::BestEffort),
            "all_or_nothing" => Ok(LoadPolicy::AllOrNothing),
            other => Err(EtlError::config(format!(
                "unknown load policy '{other}' \
                 (expected stop_on_error, best_effort or all_or_nothing)"
            ))),
        }
    }
}

/// One committed chunk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkWrite {
    pub ordinal: usize,
    pub rows: usize,
    pub mode: WriteMode,
}

/// Result of loading one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutcome {
    pub table: String,
    pub rows_written: usize,
    pub chunks: Vec<ChunkWrite>,
    /// True when there was nothing to write.
    pub skipped: bool,
    /// Row count reported by the sink after the load, if it could be read.
    pub verified_rows: Option<u64>,
}

impl LoadOutcome {
    fn skipped(table: &str) -> Self {
        Self {
            table: table.to_string(),
            rows_written: 0,
            chunks: Vec::new(),
            skipped: true,
            verified_rows: None,
        }
    }

    pub fn replaces(&self) -> usize {
        self.chunks.iter().filter(|c| c.mode == WriteMode::Replace).count()
    }

    pub fn appends(&self) -> usize {
        self.chunks.iter().filter(|c| c.mode == WriteMode::Append).count()
    }

    /// Whether the sink's count agrees with what was written.
    pub fn verified(&self) -> bool {
        self.verified_rows == Some(self.rows_written as u64)
    }
}

/// Incremental writer for one table. Used directly by the streaming pipeline,
/// and through [`LoadStage::load`] for materialized batches.
pub struct TableWriter {
    sink: Arc<dyn Sink>,
    table: String,
    target: String,
    policy: LoadPolicy,
    next_ordinal: usize,
    rows_written: usize,
    failed: Vec<usize>,
    writes: Vec<ChunkWrite>,
    events: Option<EventBus>,
}

impl TableWriter {
    pub fn new(sink: Arc<dyn Sink>, table: &str, policy: LoadPolicy) -> Self {
        let target = match policy {
            LoadPolicy::AllOrNothing => format!("{table}{STAGING_SUFFIX}"),
            _ => table.to_string(),
        };
        Self {
            sink,
            table: table.to_string(),
            target,
            policy,
            next_ordinal: 0,
            rows_written: 0,
            failed: Vec::new(),
            writes: Vec::new(),
            events: None,
        }
    }

    /// Emit a [`PipelineEvent::ChunkLoaded`] for every committed chunk.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn committed(&self) -> usize {
        self.writes.len()
    }

    /// Write the next chunk. The chunk's own ordinal is ignored; the writer
    /// numbers chunks in the order they arrive.
    pub fn write(&mut self, chunk: &Chunk<'_>) -> Result<()> {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let mode = if self.writes.is_empty() {
            WriteMode::Replace
        } else {
            WriteMode::Append
        };

        match self.sink.write(&self.target, chunk, mode) {
            Ok(()) => {
                tracing::debug!(
                    table = %self.table,
                    chunk = ordinal,
                    rows = chunk.len(),
                    %mode,
                    "Chunk committed"
                );
                self.rows_written += chunk.len();
                self.writes.push(ChunkWrite {
                    ordinal,
                    rows: chunk.len(),
                    mode,
                });
                if let Some(events) = &self.events {
                    events.emit(PipelineEvent::ChunkLoaded {
                        table: self.table.clone(),
                        chunk: ordinal,
                        rows: chunk.len(),
                        mode,
                    });
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    table = %self.table,
                    chunk = ordinal,
                    error = %e,
                    policy = %self.policy,
                    "Chunk write failed"
                );
                let failure = EtlError::SinkWriteFailed {
                    table: self.table.clone(),
                    chunk: ordinal,
                    committed: self.writes.len(),
                    message: e.to_string(),
                };
                match self.policy {
                    LoadPolicy::StopOnError => Err(failure),
                    LoadPolicy::BestEffort => {
                        self.failed.push(ordinal);
                        Ok(())
                    }
                    LoadPolicy::AllOrNothing => {
                        self.discard_staging();
                        Err(failure)
                    }
                }
            }
        }
    }

    /// Finish the table: report partial loads, swap staging into place and
    /// verify the row count.
    pub fn finish(self) -> Result<LoadOutcome> {
        if self.next_ordinal == 0 {
            tracing::warn!(table = %self.table, "Nothing to load; table left untouched");
            return Ok(LoadOutcome::skipped(&self.table));
        }
        if !self.failed.is_empty() {
            return Err(EtlError::PartialLoad {
                table: self.table,
                failed: self.failed,
                committed: self.writes.len(),
            });
        }
        if self.policy == LoadPolicy::AllOrNothing
            && let Err(e) = self.sink.rename_table(&self.target, &self.table)
        {
            self.discard_staging();
            return Err(EtlError::SinkWriteFailed {
                table: self.table.clone(),
                chunk: self.next_ordinal - 1,
                committed: 0,
                message: format!("swapping staging table into place failed: {e}"),
            });
        }

        let verified_rows = match self.sink.count_rows(&self.table) {
            Ok(n) => {
                if n != self.rows_written as u64 {
                    tracing::warn!(
                        table = %self.table,
                        expected = self.rows_written,
                        actual = n,
                        "Row count mismatch after load"
                    );
                }
                Some(n)
            }
            Err(e) => {
                tracing::warn!(table = %self.table, error = %e, "Could not verify row count");
                None
            }
        };

        tracing::info!(
            table = %self.table,
            rows = self.rows_written,
            chunks = self.writes.len(),
            "Table loaded"
        );
        Ok(LoadOutcome {
            table: self.table,
            rows_written: self.rows_written,
            chunks: self.writes,
            skipped: false,
            verified_rows,
        })
    }

    /// Give up on the table after cancellation or an upstream failure.
    /// Committed chunks stay, except for an unswapped staging table.
    pub fn abort(self) {
        if self.policy == LoadPolicy::AllOrNothing && !self.writes.is_empty() {
            self.discard_staging();
        }
    }

    fn discard_staging(&self) {
        if self.policy != LoadPolicy::AllOrNothing {
            return;
        }
        if let Err(e) = self.sink.drop_table(&self.target) {
            tracing::warn!(table = %self.target, error = %e, "Could not drop staging table");
        }
    }
}

/// Writes whole batches through a [`TableWriter`].
#[derive(Clone)]
pub struct LoadStage {
    sink: Arc<dyn Sink>,
    chunk_size: usize,
    policy: LoadPolicy,
    events: Option<EventBus>,
}

impl LoadStage {
    pub fn new(sink: Arc<dyn Sink>, chunk_size: usize, policy: LoadPolicy) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn policy(&self) -> LoadPolicy {
        self.policy
    }

    pub fn writer(&self, table: &str) -> TableWriter {
        let writer = TableWriter::new(Arc::clone(&self.sink), table, self.policy);
        match &self.events {
            Some(events) => writer.with_events(events.clone()),
            None => writer,
        }
    }

    /// Load `batch` into `table`, checking `cancel` between chunks.
    pub fn load(
        &self,
        batch: &Batch,
        table: &str,
        cancel: &CancellationToken,
    ) -> Result<LoadOutcome> {
        if batch.is_empty() {
            tracing::warn!(dataset = %batch.name, table, "Empty batch; load skipped");
            return Ok(LoadOutcome::skipped(table));
        }

        let mut writer = self.writer(table);
        for chunk in batch.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                writer.abort();
                return Err(EtlError::Cancelled);
            }
            writer.write(&chunk)?;
        }
        writer.finish()
    }
}
