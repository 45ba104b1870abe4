//! Structured progress events for a pipeline run.
//!
//! Events are broadcast to any number of subscribers (the CLI prints them)
//! and mirrored into `tracing` so log files carry the same record.

use crate::data::clean::CleaningReport;
use crate::error::Stage;
use crate::load::LoadOutcome;
use crate::pipeline::{RunMode, RunState};
use crate::sink::WriteMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

/// Events emitted while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: Uuid,
        mode: RunMode,
        sink: String,
        at: DateTime<Utc>,
    },
    /// The orchestrator moved to a new state.
    StateChanged { from: RunState, to: RunState },
    /// The sink answered the startup connection check.
    SinkReady { sink: String, version: String },
    DatasetExtracted {
        dataset: String,
        rows: usize,
        chunks: usize,
    },
    DatasetCleaned { report: CleaningReport },
    DatasetEnriched {
        dataset: String,
        rows: usize,
        columns: usize,
    },
    ChunkLoaded {
        table: String,
        chunk: usize,
        rows: usize,
        mode: WriteMode,
    },
    TableLoaded { outcome: LoadOutcome },
    StageFailed {
        dataset: String,
        stage: Stage,
        chunk: Option<usize>,
        message: String,
    },
    RunFinished {
        run_id: Uuid,
        state: RunState,
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    fn trace(&self) {
        match self {
            PipelineEvent::RunStarted { run_id, mode, sink, .. } => {
                tracing::info!(%run_id, %mode, %sink, "Run started");
            }
            PipelineEvent::StateChanged { from, to } => {
                tracing::debug!(%from, %to, "Run state changed");
            }
            PipelineEvent::SinkReady { sink, version } => {
                tracing::info!(%sink, %version, "Sink connection verified");
            }
            PipelineEvent::DatasetExtracted { dataset, rows, chunks } => {
                tracing::info!(%dataset, rows, chunks, stage = "extract", "Dataset extracted");
            }
            PipelineEvent::DatasetCleaned { report } => {
                tracing::debug!(
                    dataset = %report.dataset,
                    rows = report.rows_out,
                    stage = "clean",
                    "Dataset cleaned"
                );
            }
            PipelineEvent::DatasetEnriched { dataset, rows, columns } => {
                tracing::debug!(%dataset, rows, columns, stage = "enrich", "Dataset enriched");
            }
            PipelineEvent::ChunkLoaded { table, chunk, rows, mode } => {
                tracing::debug!(%table, chunk, rows, %mode, stage = "load", "Chunk loaded");
            }
            PipelineEvent::TableLoaded { outcome } => {
                tracing::debug!(
                    table = %outcome.table,
                    rows = outcome.rows_written,
                    stage = "load",
                    "Table loaded"
                );
            }
            PipelineEvent::StageFailed { dataset, stage, chunk, message } => {
                tracing::error!(%dataset, %stage, chunk = ?chunk, error = %message, "Stage failed");
            }
            PipelineEvent::RunFinished { run_id, state, elapsed_ms, .. } => {
                tracing::info!(%run_id, %state, elapsed_ms, "Run finished");
            }
        }
    }
}

/// Fan-out of [`PipelineEvent`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Trace the event and send it to current subscribers. Returns how many
    /// subscribers received it.
    pub fn emit(&self, event: PipelineEvent) -> usize {
        event.trace();
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        let sent = bus.emit(PipelineEvent::StateChanged {
            from: RunState::Idle,
            to: RunState::Extracting,
        });
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::DatasetExtracted {
            dataset: "airlines".into(),
            rows: 14,
            chunks: 1,
        });
        bus.emit(PipelineEvent::StateChanged {
            from: RunState::Extracting,
            to: RunState::Transforming,
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::DatasetExtracted { rows: 14, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), PipelineEvent::StateChanged { .. }));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(PipelineEvent::ChunkLoaded {
            table: "flights".into(),
            chunk: 2,
            rows: 50_000,
            mode: WriteMode::Append,
        })
        .unwrap();
        assert_eq!(json["type"], "chunk_loaded");
        assert_eq!(json["mode"], "append");
    }
}
