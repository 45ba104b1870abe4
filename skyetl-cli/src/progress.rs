//! Stdout rendering of pipeline events and the end-of-run summary.

use skyetl_core::pipeline::FailureSummary;
use skyetl_core::{LoadOutcome, PipelineEvent, RunReport};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;

/// Print events until the bus closes.
pub async fn print_events(mut rx: Receiver<PipelineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(line) = event_line(&event) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Progress printer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One progress line per event; state changes are left to the log.
pub fn event_line(event: &PipelineEvent) -> Option<String> {
    Some(match event {
        PipelineEvent::RunStarted { run_id, mode, sink, .. } => {
            format!("Run {run_id} ({mode}) -> {sink}")
        }
        PipelineEvent::StateChanged { .. } => return None,
        PipelineEvent::SinkReady { version, .. } => format!("  sink ready: {version}"),
        PipelineEvent::DatasetExtracted { dataset, rows, chunks } => {
            format!("  extracted {dataset}: {rows} rows in {chunks} chunk(s)")
        }
        PipelineEvent::DatasetCleaned { report } => format!(
            "  cleaned {}: {} -> {} rows (duplicates {}, missing {}, out of range {}, coerced {})",
            report.dataset,
            report.rows_in,
            report.rows_out,
            report.dropped_duplicates,
            report.dropped_missing,
            report.dropped_out_of_range,
            report.coercion_losses()
        ),
        PipelineEvent::DatasetEnriched { dataset, rows, columns } => {
            format!("  enriched {dataset}: {rows} rows x {columns} columns")
        }
        PipelineEvent::ChunkLoaded { table, chunk, rows, mode } => {
            format!("    {table} chunk {chunk}: {rows} rows ({mode})")
        }
        PipelineEvent::TableLoaded { outcome } => format!("  {}", load_line(outcome)),
        PipelineEvent::StageFailed { .. } => return None,
        PipelineEvent::RunFinished { state, elapsed_ms, .. } => {
            format!("Run {state} in {:.1}s", *elapsed_ms as f64 / 1000.0)
        }
    })
}

fn load_line(outcome: &LoadOutcome) -> String {
    if outcome.skipped {
        return format!("loaded {}: nothing to load (skipped)", outcome.table);
    }
    let verified = match outcome.verified_rows {
        Some(n) if outcome.verified() => format!("verified {n}"),
        Some(n) => format!("MISMATCH: sink reports {n}"),
        None => "not verified".to_string(),
    };
    format!(
        "loaded {}: {} rows in {} chunk(s), {verified}",
        outcome.table,
        outcome.rows_written,
        outcome.chunks.len()
    )
}

pub fn failure_line(failure: &FailureSummary) -> String {
    let chunk = failure
        .chunk
        .map(|c| format!(", chunk {c}"))
        .unwrap_or_default();
    format!(
        "FAILED at {} stage for '{}'{chunk}: {}",
        failure.stage, failure.dataset, failure.message
    )
}

pub fn print_summary(report: &RunReport) {
    println!();
    println!("Summary ({}):", report.state);
    for load in &report.loads {
        println!("  {}", load_line(load));
    }
    if let Some(failure) = &report.failure {
        println!("  {}", failure_line(failure));
        if !report.loads.is_empty() {
            println!("  tables loaded before the failure were kept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyetl_core::Stage;

    #[test]
    fn test_load_line_verified() {
        let outcome = LoadOutcome {
            table: "airlines".into(),
            rows_written: 14,
            chunks: vec![],
            skipped: false,
            verified_rows: Some(14),
        };
        assert_eq!(load_line(&outcome), "loaded airlines: 14 rows in 0 chunk(s), verified 14");
    }

    #[test]
    fn test_failure_line_with_chunk() {
        let failure = FailureSummary {
            dataset: "flights".into(),
            stage: Stage::Load,
            chunk: Some(2),
            message: "disk full".into(),
        };
        assert_eq!(
            failure_line(&failure),
            "FAILED at load stage for 'flights', chunk 2: disk full"
        );
    }

    #[test]
    fn test_state_changes_are_not_printed() {
        let event = PipelineEvent::StateChanged {
            from: skyetl_core::RunState::Idle,
            to: skyetl_core::RunState::Extracting,
        };
        assert!(event_line(&event).is_none());
    }
}
