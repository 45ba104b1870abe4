//! Streaming mode.
//!
//! Dimension tables are extracted, cleaned and loaded first; the enricher is
//! built from them. The fact table then flows chunk by chunk through four
//! stages on the blocking pool, connected by bounded `mpsc` channels:
//!
//! ```text
//! extract --> clean --> enrich --> load
//! ```
//!
//! A full channel blocks the producer. A failing stage cancels the stream's
//! token and drops its channel ends so the other stages wind down.

use super::{ExtractSummary, Pipeline, RunReport, RunState};
use crate::data::assemble::align_columns;
use crate::data::batch::Batch;
use crate::data::clean::{CleaningReport, StreamingCleaner};
use crate::data::enrich::Enricher;
use crate::data::registry::DatasetDefinition;
use crate::data::schema::{Column, Value};
use crate::data::source::SourceConfig;
use crate::error::{EtlError, Result, Stage, StageFailure};
use crate::events::PipelineEvent;
use crate::load::{LoadOutcome, TableWriter};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// A fact chunk tagged with its source ordinal.
type Item = (usize, Batch);

pub(crate) async fn run(p: &mut Pipeline, report: &mut RunReport) -> Result<(), StageFailure> {
    p.ping_sink(report).await?;
    let registry = p.config.registry.clone();
    let fact_def = registry
        .fact()
        .cloned()
        .ok_or_else(|| {
            let e = EtlError::config("no fact dataset registered");
            StageFailure::new("", Stage::Extract, e)
        })?;
    let dimension_defs: Vec<DatasetDefinition> = registry.dimensions().cloned().collect();

    p.transition(RunState::Extracting);
    let mut raw = Vec::with_capacity(dimension_defs.len());
    for def in &dimension_defs {
        raw.push(p.extract(def, report).await?);
    }

    p.transition(RunState::Transforming);
    let mut dimensions = HashMap::new();
    for (def, batch) in dimension_defs.iter().zip(raw) {
        let cleaned = p.clean(def, batch, report).await?;
        dimensions.insert(def.name.clone(), cleaned);
    }
    let enricher = Enricher::new(&registry, &dimensions)
        .map_err(|e| StageFailure::new(&fact_def.name, Stage::Enrich, e))?;

    p.transition(RunState::Loading);
    for def in &dimension_defs {
        let batch = dimensions.remove(&def.name).unwrap_or_else(|| Batch::empty(&def.name));
        p.load(def, batch, report).await?;
    }

    p.check_cancelled(&fact_def.name, Stage::Extract)?;
    stream_fact(p, &fact_def, enricher, report).await
}

async fn stream_fact(
    p: &Pipeline,
    def: &DatasetDefinition,
    enricher: Enricher,
    report: &mut RunReport,
) -> Result<(), StageFailure> {
    let source = p
        .config
        .source(&def.name)
        .map_err(|e| StageFailure::new(&def.name, Stage::Extract, e))?;
    let capacity = p.config.channel_capacity.max(1);
    let abort = p.cancel.child_token();

    let (raw_tx, raw_rx) = mpsc::channel::<Item>(capacity);
    let (clean_tx, clean_rx) = mpsc::channel::<Item>(capacity);
    let (rich_tx, rich_rx) = mpsc::channel::<Item>(capacity);

    tracing::info!(
        dataset = %def.name,
        capacity,
        chunk_size = p.config.chunk_size,
        "Streaming fact table"
    );

    let extract = {
        let (name, chunk_size, abort) = (def.name.clone(), p.config.chunk_size, abort.clone());
        tokio::task::spawn_blocking(move || extract_stage(name, source, chunk_size, raw_tx, abort))
    };
    let clean = {
        let (def, abort) = (def.clone(), abort.clone());
        tokio::task::spawn_blocking(move || clean_stage(def, raw_rx, clean_tx, abort))
    };
    let enrich = {
        let (name, abort) = (def.name.clone(), abort.clone());
        tokio::task::spawn_blocking(move || enrich_stage(name, enricher, clean_rx, rich_tx, abort))
    };
    let load = {
        let (name, writer, limit) = (
            def.name.clone(),
            p.load_stage().writer(&def.table),
            p.config.flights_row_limit,
        );
        let abort = abort.clone();
        tokio::task::spawn_blocking(move || load_stage(name, writer, rich_rx, limit, abort))
    };

    let (extracted, cleaned, enriched, loaded) = tokio::join!(extract, clean, enrich, load);
    let extracted = joined(&def.name, Stage::Extract, extracted);
    let cleaned = joined(&def.name, Stage::Clean, cleaned);
    let enriched = joined(&def.name, Stage::Enrich, enriched);
    let loaded = joined(&def.name, Stage::Load, loaded);

    if let Ok(summary) = &extracted {
        p.events.emit(PipelineEvent::DatasetExtracted {
            dataset: summary.dataset.clone(),
            rows: summary.rows,
            chunks: summary.chunks,
        });
        report.extracted.push(summary.clone());
    }
    if let Ok(cleaning) = &cleaned {
        p.events.emit(PipelineEvent::DatasetCleaned {
            report: cleaning.clone(),
        });
        report.cleaning.push(cleaning.clone());
    }
    if let Ok((rows, columns)) = &enriched {
        p.events.emit(PipelineEvent::DatasetEnriched {
            dataset: def.name.clone(),
            rows: *rows,
            columns: *columns,
        });
    }
    if let Ok(outcome) = &loaded {
        p.events.emit(PipelineEvent::TableLoaded {
            outcome: outcome.clone(),
        });
        report.loads.push(outcome.clone());
    }

    // The first stage that failed for a reason other than the stream being
    // cancelled is the one to report.
    let mut failures: Vec<StageFailure> =
        [extracted.err(), cleaned.err(), enriched.err(), loaded.err()]
            .into_iter()
        .flatten()
        .collect();
    if failures.is_empty() {
        return Ok(());
    }
    let pos = failures
        .iter()
        .position(|f| !matches!(f.source, EtlError::Cancelled))
        .unwrap_or(0);
    Err(failures.swap_remove(pos))
}

fn joined<T>(
    dataset: &str,
    stage: Stage,
    result: std::result::Result<Result<T, StageFailure>, JoinError>,
) -> Result<T, StageFailure> {
    result.map_err(|e| StageFailure::new(dataset, stage, EtlError::Task(e.to_string())))?
}

fn extract_stage(
    dataset: String,
    source: SourceConfig,
    chunk_size: usize,
    tx: Sender<Item>,
    abort: CancellationToken,
) -> Result<ExtractSummary, StageFailure> {
    let fail = |e: EtlError| {
        abort.cancel();
        StageFailure::new(&dataset, Stage::Extract, e)
    };
    let reader = source.reader(&dataset);
    tracing::info!(dataset = %dataset, location = %reader.location(), "Extracting dataset");
    let chunks = reader.read_chunks(chunk_size).map_err(fail)?;

    let mut summary = ExtractSummary {
        dataset: dataset.clone(),
        rows: 0,
        chunks: 0,
    };
    let mut layout: Vec<Column> = Vec::new();
    for (ordinal, chunk) in chunks.enumerate() {
        if abort.is_cancelled() {
            break;
        }
        let chunk = chunk.map_err(|e| fail(e).with_chunk(ordinal))?;
        let chunk = if ordinal == 0 {
            layout = chunk.columns.clone();
            chunk
        } else {
            conform(&dataset, ordinal, &mut layout, chunk).map_err(fail)?
        };
        summary.rows += chunk.row_count();
        summary.chunks += 1;
        tracing::debug!(
            dataset = %dataset,
            chunk = ordinal,
            rows = chunk.row_count(),
            "Chunk extracted"
        );
        if tx.blocking_send((ordinal, chunk)).is_err() {
            // downstream stopped
            break;
        }
    }
    Ok(summary)
}

/// Fit a later chunk to the stream's column layout.
///
/// Columns are reordered to `layout`; columns the chunk lacks read as null and
/// extra columns are a schema mismatch. Every cell is converted to its layout
/// column's kind. A cell that kind cannot hold widens the layout column, which
/// then applies to this chunk and every chunk after it.
fn conform(dataset: &str, ordinal: usize, layout: &mut [Column], chunk: Batch) -> Result<Batch> {
    let mapping = align_columns(dataset, ordinal, layout, &chunk.columns)?;

    for (col, source) in layout.iter_mut().zip(&mapping) {
        let Some(src) = *source else { continue };
        let widened = chunk.rows.iter().fold(col.kind, |kind, row| {
            match row[src].clone().convert_to(kind) {
                Ok(_) => kind,
                Err(v) => v.kind().map_or(kind, |k| kind.unify(k)),
            }
        });
        if widened != col.kind {
            tracing::debug!(
                dataset,
                chunk = ordinal,
                column = %col.name,
                from = %col.kind,
                to = %widened,
                "Widening column for the rest of the stream"
            );
            col.kind = widened;
        }
    }

    let rows = chunk
        .rows
        .into_iter()
        .map(|mut row| {
            mapping
                .iter()
                .zip(layout.iter())
                .map(|(source, col)| match source {
                    Some(src) => std::mem::replace(&mut row[*src], Value::Null)
                        .convert_to(col.kind)
                        .unwrap_or_else(|v| v.widen_to(col.kind)),
                    None => Value::Null,
                })
                .collect()
        })
        .collect();
    Ok(Batch::new(chunk.name, layout.to_vec(), rows))
}

fn clean_stage(
    def: DatasetDefinition,
    mut rx: Receiver<Item>,
    tx: Sender<Item>,
    abort: CancellationToken,
) -> Result<CleaningReport, StageFailure> {
    let mut cleaner = StreamingCleaner::new(def.clone());
    while let Some((ordinal, chunk)) = rx.blocking_recv() {
        if abort.is_cancelled() {
            break;
        }
        let cleaned = cleaner.clean_chunk(chunk).map_err(|e| {
            abort.cancel();
            StageFailure::new(&def.name, Stage::Clean, e).with_chunk(ordinal)
        })?;
        if tx.blocking_send((ordinal, cleaned)).is_err() {
            break;
        }
    }
    Ok(cleaner.report().clone())
}

/// Returns total enriched rows and the output column count.
fn enrich_stage(
    dataset: String,
    enricher: Enricher,
    mut rx: Receiver<Item>,
    tx: Sender<Item>,
    abort: CancellationToken,
) -> Result<(usize, usize), StageFailure> {
    let (mut rows, mut columns) = (0, 0);
    while let Some((ordinal, chunk)) = rx.blocking_recv() {
        if abort.is_cancelled() {
            break;
        }
        let enriched = enricher.enrich(chunk).map_err(|e| {
            abort.cancel();
            StageFailure::new(&dataset, Stage::Enrich, e).with_chunk(ordinal)
        })?;
        rows += enriched.row_count();
        columns = columns.max(enriched.column_count());
        if tx.blocking_send((ordinal, enriched)).is_err() {
            break;
        }
    }
    Ok((rows, columns))
}

fn load_stage(
    dataset: String,
    mut writer: TableWriter,
    mut rx: Receiver<Item>,
    limit: Option<usize>,
    abort: CancellationToken,
) -> Result<LoadOutcome, StageFailure> {
    let mut remaining = limit;
    while let Some((ordinal, mut batch)) = rx.blocking_recv() {
        if abort.is_cancelled() {
            break;
        }
        if let Some(left) = remaining {
            if batch.row_count() > left {
                tracing::info!(
                    dataset = %dataset,
                    limit = ?limit,
                    "Row limit reached; stopping the stream"
                );
                batch.rows.truncate(left);
            }
            remaining = Some(left - batch.row_count());
        }
        if !batch.is_empty() {
            writer.write(&batch.as_chunk(ordinal)).map_err(|e| {
                abort.cancel();
                StageFailure::new(&dataset, Stage::Load, e)
            })?;
        }
        if remaining == Some(0) {
            break;
        }
    }

    if abort.is_cancelled() {
        writer.abort();
        return Err(StageFailure::new(&dataset, Stage::Load, EtlError::Cancelled));
    }
    writer
        .finish()
        .map_err(|e| StageFailure::new(&dataset, Stage::Load, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::ColumnKind;

    fn cols(names: &[&str]) -> Vec<Column> {
        names.iter().map(|n| Column::new(*n, ColumnKind::String)).collect()
    }

    #[test]
    fn test_conform_reorders_and_fills() {
        let mut layout = cols(&["a", "b", "c"]);
        let chunk = Batch::new(
            "flights",
            cols(&["c", "a"]),
            vec![vec![Value::from("c1"), Value::from("a1")]],
        );
        let out = conform("flights", 1, &mut layout, chunk).unwrap();
        assert_eq!(out.column_names(), vec!["a", "b", "c"]);
        assert_eq!(out.rows[0], vec![Value::from("a1"), Value::Null, Value::from("c1")]);
    }

    #[test]
    fn test_conform_rejects_extra_column() {
        let chunk = Batch::new("flights", cols(&["a", "z"]), vec![]);
        let err = conform("flights", 3, &mut cols(&["a"]), chunk).unwrap_err();
        assert!(matches!(err, EtlError::SchemaMismatch { chunk: 3, .. }));
    }

    #[test]
    fn test_conform_converts_cells_to_layout_kinds() {
        let mut layout = vec![
            Column::new("FLIGHT_NUMBER", ColumnKind::Integer),
            Column::new("DEPARTURE_DELAY", ColumnKind::Float),
        ];
        let chunk = Batch::new(
            "flights",
            vec![
                Column::new("FLIGHT_NUMBER", ColumnKind::String),
                Column::new("DEPARTURE_DELAY", ColumnKind::Integer),
            ],
            vec![vec![Value::from("98"), Value::Int(-3)]],
        );
        let out = conform("flights", 1, &mut layout, chunk).unwrap();
        assert_eq!(out.columns, layout);
        assert_eq!(layout[0].kind, ColumnKind::Integer);
        assert_eq!(out.rows[0], vec![Value::Int(98), Value::Float(-3.0)]);
    }

    #[test]
    fn test_conform_widens_layout_for_later_chunks() {
        let mut layout = vec![Column::new("TAIL_NUMBER", ColumnKind::Integer)];
        let chunk = Batch::new(
            "flights",
            vec![Column::new("TAIL_NUMBER", ColumnKind::String)],
            vec![vec![Value::from("123")], vec![Value::from("N1X")]],
        );
        let out = conform("flights", 1, &mut layout, chunk).unwrap();
        assert_eq!(layout[0].kind, ColumnKind::String);
        assert_eq!(out.columns[0].kind, ColumnKind::String);
        assert_eq!(out.rows, vec![vec![Value::from("123")], vec![Value::from("N1X")]]);
        assert!(out.check_shape());

        let next = Batch::new(
            "flights",
            vec![Column::new("TAIL_NUMBER", ColumnKind::Integer)],
            vec![vec![Value::Int(456)]],
        );
        let out = conform("flights", 2, &mut layout, next).unwrap();
        assert_eq!(out.rows[0][0], Value::from("456"));
    }
}
