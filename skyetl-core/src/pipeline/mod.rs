//! Pipeline orchestrator: runs extract, transform and load for every dataset
//! and reports where a run stopped.
//!
//! A run moves forward through [`RunState`] only. In materialized mode every
//! dataset is extracted, then transformed, then loaded; in streaming mode the
//! dimension tables go first and the fact table flows through bounded
//! channels (see [`streaming`]).

pub mod streaming;

use crate::config::EtlConfig;
use crate::data::assemble::{Assembled, assemble};
use crate::data::batch::Batch;
use crate::data::clean::{CleaningReport, clean};
use crate::data::enrich::Enricher;
use crate::data::registry::DatasetDefinition;
use crate::data::source::{SourceConfig, SourceShape};
use crate::error::{EtlError, Result, Stage, StageFailure};
use crate::events::{EventBus, PipelineEvent};
use crate::load::{LoadOutcome, LoadStage};
use crate::sink::Sink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How the fact table moves through the stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Each stage completes for all datasets before the next begins.
    #[default]
    Materialized,
    /// Fact chunks flow through all stages concurrently.
    Streaming,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Materialized => write!(f, "materialized"),
            RunMode::Streaming => write!(f, "streaming"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "materialized" => Ok(RunMode::Materialized),
            "streaming" => Ok(RunMode::Streaming),
            other => Err(EtlError::config(format!(
                "unknown mode '{other}' (expected materialized or streaming)"
            ))),
        }
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Done,
    Failed,
}

impl RunState {
    fn rank(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Extracting => 1,
            RunState::Transforming => 2,
            RunState::Loading => 3,
            RunState::Done | RunState::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Transitions only move forward; any non-terminal state may fail.
    pub fn can_transition_to(self, next: RunState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Extracting => write!(f, "extracting"),
            RunState::Transforming => write!(f, "transforming"),
            RunState::Loading => write!(f, "loading"),
            RunState::Done => write!(f, "done"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Rows and chunks read for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractSummary {
    pub dataset: String,
    pub rows: usize,
    pub chunks: usize,
}

/// Where and why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub dataset: String,
    pub stage: Stage,
    pub chunk: Option<usize>,
    pub message: String,
}

impl From<&StageFailure> for FailureSummary {
    fn from(f: &StageFailure) -> Self {
        Self {
            dataset: f.dataset.clone(),
            stage: f.stage,
            chunk: f.chunk,
            message: f.source.to_string(),
        }
    }
}

/// Everything a finished run has to say about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sink_version: Option<String>,
    pub extracted: Vec<ExtractSummary>,
    pub cleaning: Vec<CleaningReport>,
    pub loads: Vec<LoadOutcome>,
    pub failure: Option<FailureSummary>,
    pub cancelled: bool,
}

impl RunReport {
    fn new(run_id: Uuid, mode: RunMode) -> Self {
        Self {
            run_id,
            mode,
            state: RunState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            sink_version: None,
            extracted: Vec::new(),
            cleaning: Vec::new(),
            loads: Vec::new(),
            failure: None,
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn load_for(&self, table: &str) -> Option<&LoadOutcome> {
        self.loads.iter().find(|l| l.table == table)
    }
}

/// Runs one pipeline against an injected sink.
pub struct Pipeline {
    config: EtlConfig,
    sink: Arc<dyn Sink>,
    events: EventBus,
    cancel: CancellationToken,
    state: RunState,
    run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: EtlConfig, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            sink,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            state: RunState::Idle,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Token that stops the run between chunks when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Execute the run. Failures are reported in the returned [`RunReport`];
    /// tables loaded before a failure stay loaded.
    pub async fn run(&mut self) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(self.run_id, self.config.mode);

        if self.state != RunState::Idle {
            report.state = self.state;
            report.failure = Some(FailureSummary {
                dataset: String::new(),
                stage: Stage::Extract,
                chunk: None,
                message: format!("pipeline already ran (state {})", self.state),
            });
            return report;
        }

        self.events.emit(PipelineEvent::RunStarted {
            run_id: self.run_id,
            mode: self.config.mode,
            sink: self.sink.describe(),
            at: report.started_at,
        });

        let result = match self.config.mode {
            RunMode::Materialized => self.run_materialized(&mut report).await,
            RunMode::Streaming => streaming::run(self, &mut report).await,
        };

        match result {
            Ok(()) => self.transition(RunState::Done),
            Err(failure) => {
                report.cancelled = matches!(failure.source, EtlError::Cancelled);
                self.events.emit(PipelineEvent::StageFailed {
                    dataset: failure.dataset.clone(),
                    stage: failure.stage,
                    chunk: failure.chunk,
                    message: failure.source.to_string(),
                });
                report.failure = Some(FailureSummary::from(&failure));
                self.transition(RunState::Failed);
            }
        }

        report.state = self.state;
        let finished_at = Utc::now();
        report.finished_at = Some(finished_at);
        self.events.emit(PipelineEvent::RunFinished {
            run_id: self.run_id,
            state: self.state,
            elapsed_ms: started.elapsed().as_millis() as u64,
            at: finished_at,
        });
        report
    }

    fn transition(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "Ignoring backward state transition");
            return;
        }
        self.events.emit(PipelineEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    fn check_cancelled(&self, dataset: &str, stage: Stage) -> Result<(), StageFailure> {
        if self.cancel.is_cancelled() {
            return Err(StageFailure::new(dataset, stage, EtlError::Cancelled));
        }
        Ok(())
    }

    /// Connection check before any work is done.
    async fn ping_sink(&self, report: &mut RunReport) -> Result<(), StageFailure> {
        let sink = Arc::clone(&self.sink);
        let version = blocking(move || sink.ping())
            .await
            .map_err(|e| StageFailure::new(self.sink.describe(), Stage::Load, e))?;
        self.events.emit(PipelineEvent::SinkReady {
            sink: self.sink.describe(),
            version: version.clone(),
        });
        report.sink_version = Some(version);
        Ok(())
    }

    fn load_stage(&self) -> LoadStage {
        LoadStage::new(
            Arc::clone(&self.sink),
            self.config.chunk_size,
            self.config.load_policy,
        )
        .with_events(self.events.clone())
    }

    async fn extract(
        &self,
        def: &DatasetDefinition,
        report: &mut RunReport,
    ) -> Result<Batch, StageFailure> {
        self.check_cancelled(&def.name, Stage::Extract)?;
        let source = self
            .config
            .source(&def.name)
            .map_err(|e| StageFailure::new(&def.name, Stage::Extract, e))?;
        let assembled = extract_dataset(
            def.name.clone(),
            source,
            self.config.chunk_size,
            self.cancel.clone(),
        )
        .await
        .map_err(|e| StageFailure::new(&def.name, Stage::Extract, e))?;

        let summary = ExtractSummary {
            dataset: def.name.clone(),
            rows: assembled.batch.row_count(),
            chunks: assembled.chunks,
        };
        self.events.emit(PipelineEvent::DatasetExtracted {
            dataset: summary.dataset.clone(),
            rows: summary.rows,
            chunks: summary.chunks,
        });
        report.extracted.push(summary);
        Ok(assembled.batch)
    }

    async fn clean(
        &self,
        def: &DatasetDefinition,
        batch: Batch,
        report: &mut RunReport,
    ) -> Result<Batch, StageFailure> {
        self.check_cancelled(&def.name, Stage::Clean)?;
        let owned = def.clone();
        let (cleaned, cleaning) = blocking(move || clean(&owned, batch))
            .await
            .map_err(|e| StageFailure::new(&def.name, Stage::Clean, e))?;
        self.events.emit(PipelineEvent::DatasetCleaned {
            report: cleaning.clone(),
        });
        report.cleaning.push(cleaning);
        Ok(cleaned)
    }

    async fn load(
        &self,
        def: &DatasetDefinition,
        batch: Batch,
        report: &mut RunReport,
    ) -> Result<(), StageFailure> {
        self.check_cancelled(&def.name, Stage::Load)?;
        let stage = self.load_stage();
        let table = def.table.clone();
        let cancel = self.cancel.clone();
        let outcome = blocking(move || stage.load(&batch, &table, &cancel))
            .await
            .map_err(|e| StageFailure::new(&def.name, Stage::Load, e))?;
        self.events.emit(PipelineEvent::TableLoaded {
            outcome: outcome.clone(),
        });
        report.loads.push(outcome);
        Ok(())
    }

    fn apply_row_limit(&self, fact: &mut Batch) {
        if let Some(limit) = self.config.flights_row_limit
            && fact.row_count() > limit
        {
            tracing::info!(
                dataset = %fact.name,
                limit,
                dropped = fact.row_count() - limit,
                "Applying row limit"
            );
            fact.rows.truncate(limit);
        }
    }

    async fn run_materialized(&mut self, report: &mut RunReport) -> Result<(), StageFailure> {
        self.ping_sink(report).await?;
        let registry = self.config.registry.clone();
        let fact_def = registry
            .fact()
            .cloned()
            .ok_or_else(|| {
                let e = EtlError::config("no fact dataset registered");
                StageFailure::new("", Stage::Extract, e)
            })?;
        let dimension_defs: Vec<DatasetDefinition> = registry.dimensions().cloned().collect();

        self.transition(RunState::Extracting);
        let fact_raw = self.extract(&fact_def, report).await?;
        let mut dimensions_raw = Vec::with_capacity(dimension_defs.len());
        for def in &dimension_defs {
            dimensions_raw.push(self.extract(def, report).await?);
        }

        self.transition(RunState::Transforming);
        let fact_clean = self.clean(&fact_def, fact_raw, report).await?;
        let mut dimensions = HashMap::new();
        for (def, raw) in dimension_defs.iter().zip(dimensions_raw) {
            let cleaned = self.clean(def, raw, report).await?;
            dimensions.insert(def.name.clone(), cleaned);
        }

        self.check_cancelled(&fact_def.name, Stage::Enrich)?;
        let enrich_err = |e| StageFailure::new(&fact_def.name, Stage::Enrich, e);
        let enricher = Enricher::new(&registry, &dimensions).map_err(enrich_err)?;
        let mut enriched = blocking(move || enricher.enrich(fact_clean))
            .await
            .map_err(enrich_err)?;
        self.events.emit(PipelineEvent::DatasetEnriched {
            dataset: fact_def.name.clone(),
            rows: enriched.row_count(),
            columns: enriched.column_count(),
        });
        self.apply_row_limit(&mut enriched);

        self.transition(RunState::Loading);
        for def in &dimension_defs {
            let batch = dimensions.remove(&def.name).unwrap_or_else(|| Batch::empty(&def.name));
            self.load(def, batch, report).await?;
        }
        self.load(&fact_def, enriched, report).await
    }
}

/// Run a blocking closure on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EtlError::Task(e.to_string()))?
}

/// Read one dataset in chunks and assemble it, stopping between chunks when
/// `cancel` fires.
async fn extract_dataset(
    dataset: String,
    source: SourceConfig,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<Assembled> {
    blocking(move || {
        let reader = source.reader(&dataset);
        tracing::info!(dataset = %dataset, location = %reader.location(), "Extracting dataset");
        let shape = match reader.open(Some(chunk_size))? {
            SourceShape::Chunked(chunks) => SourceShape::Chunked(Box::new(chunks.map(move |c| {
                if cancel.is_cancelled() {
                    Err(EtlError::Cancelled)
                } else {
                    c
                }
            }))),
            single => single,
        };
        assemble(&dataset, shape)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_forward_only() {
        assert!(RunState::Idle.can_transition_to(RunState::Extracting));
        assert!(RunState::Extracting.can_transition_to(RunState::Failed));
        assert!(RunState::Idle.can_transition_to(RunState::Loading));
        assert!(!RunState::Loading.can_transition_to(RunState::Extracting));
        assert!(!RunState::Done.can_transition_to(RunState::Failed));
        assert!(!RunState::Failed.can_transition_to(RunState::Done));
        assert!(!RunState::Loading.can_transition_to(RunState::Loading));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Streaming".parse::<RunMode>().unwrap(), RunMode::Streaming);
        assert!("batch".parse::<RunMode>().is_err());
        assert_eq!(RunMode::default().to_string(), "materialized");
    }
}
