//! Cleaning stage: per-dataset row filtering and numeric repair.
//!
//! Rules run in a fixed order: required-field drop, duplicate removal, numeric
//! coercion, range filter. Duplicate detection compares rows on their
//! post-coercion values, so coercion cannot leave duplicates behind and a
//! second pass over cleaned output removes nothing.

use crate::data::batch::{Batch, Row};
use crate::data::registry::DatasetDefinition;
use crate::data::schema::{ColumnKind, Value};
use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Counts produced by one cleaning pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub dataset: String,
    pub rows_in: usize,
    pub dropped_missing: usize,
    pub dropped_duplicates: usize,
    pub dropped_out_of_range: usize,
    /// Per column, how many values were replaced with zero during coercion.
    pub coerced_to_zero: BTreeMap<String, usize>,
    pub rows_out: usize,
}

impl CleaningReport {
    pub fn coercion_losses(&self) -> usize {
        self.coerced_to_zero.values().sum()
    }

    /// Fold another report for the same dataset into this one.
    pub fn absorb(&mut self, other: &CleaningReport) {
        self.rows_in += other.rows_in;
        self.dropped_missing += other.dropped_missing;
        self.dropped_duplicates += other.dropped_duplicates;
        self.dropped_out_of_range += other.dropped_out_of_range;
        for (col, n) in &other.coerced_to_zero {
            *self.coerced_to_zero.entry(col.clone()).or_default() += n;
        }
        self.rows_out += other.rows_out;
    }
}

/// Clean a whole batch. Deterministic and independent of any other call.
pub fn clean(def: &DatasetDefinition, batch: Batch) -> Result<(Batch, CleaningReport)> {
    let mut seen = HashSet::new();
    let (batch, report) = clean_with(def, batch, &mut seen)?;
    tracing::info!(
        dataset = %def.name,
        rows_in = report.rows_in,
        rows_out = report.rows_out,
        duplicates = report.dropped_duplicates,
        missing = report.dropped_missing,
        out_of_range = report.dropped_out_of_range,
        coerced = report.coercion_losses(),
        "Cleaned dataset"
    );
    Ok((batch, report))
}

/// Cleans a dataset chunk by chunk, remembering rows across chunks so the
/// concatenated output equals cleaning the concatenated input.
#[derive(Debug)]
pub struct StreamingCleaner {
    def: DatasetDefinition,
    seen: HashSet<Row>,
    report: CleaningReport,
}

impl StreamingCleaner {
    pub fn new(def: DatasetDefinition) -> Self {
        let report = CleaningReport {
            dataset: def.name.clone(),
            ..Default::default()
        };
        Self {
            def,
            seen: HashSet::new(),
            report,
        }
    }

    pub fn clean_chunk(&mut self, chunk: Batch) -> Result<Batch> {
        let (batch, report) = clean_with(&self.def, chunk, &mut self.seen)?;
        self.report.absorb(&report);
        Ok(batch)
    }

    /// Totals across every chunk cleaned so far.
    pub fn report(&self) -> &CleaningReport {
        &self.report
    }
}

fn column_indices(
    dataset: &str,
    batch: &Batch,
    names: &[String],
    strict: bool,
) -> Result<Vec<usize>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match batch.column_index(name) {
            Some(idx) => out.push(idx),
            None if strict => return Err(EtlError::missing_column(dataset, name)),
            None => {}
        }
    }
    Ok(out)
}

/// Numeric view of a cell for coercion. `None` means the value is lost.
fn coerce(value: &Value) -> Option<f64> {
    value.as_f64().filter(|f| f.is_finite())
}

/// Row identity for duplicate detection. Numeric columns compare on their
/// coerced value, every other cell on its canonical text, so chunks whose
/// kinds were inferred differently still agree on what a duplicate is.
fn dedup_key(row: &Row, numeric: &[usize]) -> Row {
    let mut key: Row = row.iter().map(Value::canonical).collect();
    for &idx in numeric {
        key[idx] = Value::Float(coerce(&row[idx]).unwrap_or(0.0));
    }
    key
}

fn clean_with(
    def: &DatasetDefinition,
    mut batch: Batch,
    seen: &mut HashSet<Row>,
) -> Result<(Batch, CleaningReport)> {
    let mut report = CleaningReport {
        dataset: def.name.clone(),
        rows_in: batch.row_count(),
        ..Default::default()
    };

    if batch.is_empty() {
        tracing::warn!(dataset = %def.name, "Empty dataset; nothing to clean");
        return Ok((batch, report));
    }

    let rules = &def.rules;
    let required = column_indices(&def.name, &batch, &rules.required, true)?;
    let numeric = column_indices(&def.name, &batch, &rules.numeric, false)?;
    let bounded = column_indices(&def.name, &batch, &rules.bounded, false)?;

    // 1. required fields
    let before = batch.row_count();
    batch
        .rows
        .retain(|row| required.iter().all(|&i| !row[i].is_null()));
    report.dropped_missing = before - batch.row_count();

    // 2. duplicates, first occurrence wins
    let before = batch.row_count();
    batch
        .rows
        .retain(|row| seen.insert(dedup_key(row, &numeric)));
    report.dropped_duplicates = before - batch.row_count();

    // 3. numeric coercion
    for &idx in &numeric {
        let mut lost = 0;
        for row in &mut batch.rows {
            let v = coerce(&row[idx]).unwrap_or_else(|| {
                lost += 1;
                0.0
            });
            row[idx] = Value::Float(v);
        }
        batch.columns[idx].kind = ColumnKind::Float;
        if lost > 0 {
            report
                .coerced_to_zero
                .insert(batch.columns[idx].name.clone(), lost);
        }
    }

    // 4. range filter
    if let Some(bounds) = rules.bounds
        && !bounded.is_empty()
    {
        let before = batch.row_count();
        batch.rows.retain(|row| {
            bounded
                .iter()
                .all(|&i| row[i].as_f64().is_some_and(|v| bounds.contains(v)))
        });
        report.dropped_out_of_range = before - batch.row_count();
    }

    report.rows_out = batch.row_count();
    Ok((batch, report))
}
