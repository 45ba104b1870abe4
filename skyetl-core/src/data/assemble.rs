//! Chunk assembler: turns either source shape into one logical batch.

use crate::data::batch::Batch;
use crate::data::schema::{Column, Value};
use crate::data::source::SourceShape;
use crate::error::{EtlError, Result};

/// Result of assembling a source, with the number of chunks consumed.
#[derive(Debug)]
pub struct Assembled {
    pub batch: Batch,
    pub chunks: usize,
}

/// Materialize `shape` into a single batch named `dataset`.
///
/// Chunks are concatenated in arrival order using the first chunk's column
/// order. A column that only appears in a later chunk is a schema mismatch;
/// a first-chunk column missing from a later chunk reads as null. Column kinds
/// are widened when chunks disagree.
pub fn assemble(dataset: &str, shape: SourceShape) -> Result<Assembled> {
    match shape {
        SourceShape::Single(mut batch) => {
            batch.name = dataset.to_string();
            Ok(Assembled { batch, chunks: 1 })
        }
        SourceShape::Chunked(chunks) => {
            let mut assembler = ChunkAssembler::new(dataset);
            for chunk in chunks {
                assembler.push(chunk?)?;
            }
            let chunks = assembler.chunks;
            let batch = assembler.finish();
            if chunks == 0 {
                tracing::warn!(
                    dataset,
                    "Source produced no chunks; continuing with an empty batch"
                );
            } else if chunks > 1 {
                tracing::info!(
                    dataset,
                    chunks,
                    rows = batch.row_count(),
                    "Combined chunks into one batch"
                );
            }
            Ok(Assembled { batch, chunks })
        }
    }
}

/// Incremental concatenation of chunks sharing the first chunk's layout.
#[derive(Debug)]
pub struct ChunkAssembler {
    batch: Batch,
    chunks: usize,
}

impl ChunkAssembler {
    pub fn new(dataset: &str) -> Self {
        Self {
            batch: Batch::empty(dataset),
            chunks: 0,
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Append one chunk.
    pub fn push(&mut self, chunk: Batch) -> Result<()> {
        let ordinal = self.chunks;
        self.chunks += 1;

        if ordinal == 0 {
            self.batch.columns = chunk.columns;
            self.batch.rows = chunk.rows;
            return Ok(());
        }

        let mapping =
            align_columns(&self.batch.name, ordinal, &self.batch.columns, &chunk.columns)?;

        // Widen kinds where the new chunk disagrees, rewriting existing rows once.
        for (target, source) in mapping.iter().enumerate() {
            let Some(src) = source else { continue };
            let existing = self.batch.columns[target].kind;
            let unified = existing.unify(chunk.columns[*src].kind);
            if unified != existing {
                self.batch.columns[target].kind = unified;
                for row in &mut self.batch.rows {
                    row[target] =
                        std::mem::replace(&mut row[target], Value::Null).widen_to(unified);
                }
            }
        }

        let kinds: Vec<_> = self.batch.columns.iter().map(|c| c.kind).collect();
        self.batch.rows.reserve(chunk.rows.len());
        for mut row in chunk.rows {
            let aligned = mapping
                .iter()
                .zip(&kinds)
                .map(|(source, kind)| match source {
                    Some(src) => std::mem::replace(&mut row[*src], Value::Null).widen_to(*kind),
                    None => Value::Null,
                })
                .collect();
            self.batch.rows.push(aligned);
        }
        Ok(())
    }

    pub fn finish(self) -> Batch {
        self.batch
    }
}

/// For each column of `first`, the index of the same-named column in `next`.
pub(crate) fn align_columns(
    dataset: &str,
    ordinal: usize,
    first: &[Column],
    next: &[Column],
) -> Result<Vec<Option<usize>>> {
    if let Some(extra) = next.iter().find(|c| !first.iter().any(|f| f.name == c.name)) {
        return Err(EtlError::SchemaMismatch {
            dataset: dataset.to_string(),
            chunk: ordinal,
            column: extra.name.clone(),
        });
    }
    Ok(first
        .iter()
        .map(|f| next.iter().position(|c| c.name == f.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::ColumnKind;

    fn chunk(cols: &[(&str, ColumnKind)], rows: Vec<Vec<Value>>) -> Batch {
        Batch::new(
            "raw",
            cols.iter().map(|(n, k)| Column::new(*n, *k)).collect(),
            rows,
        )
    }

    fn chunked(chunks: Vec<Batch>) -> SourceShape {
        SourceShape::Chunked(Box::new(chunks.into_iter().map(Ok)))
    }

    #[test]
    fn test_single_passes_through() {
        let batch = chunk(&[("a", ColumnKind::Integer)], vec![vec![Value::Int(1)]]);
        let out = assemble("flights", SourceShape::Single(batch.clone())).unwrap();
        assert_eq!(out.batch.rows, batch.rows);
        assert_eq!(out.batch.name, "flights");
    }

    #[test]
    fn test_concatenates_in_order() {
        let a = chunk(
            &[("n", ColumnKind::Integer)],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        let b = chunk(&[("n", ColumnKind::Integer)], vec![vec![Value::Int(3)]]);
        let out = assemble("t", chunked(vec![a, b])).unwrap();
        assert_eq!(out.chunks, 2);
        assert_eq!(
            out.batch.rows,
            vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]
        );
    }

    #[test]
    fn test_reorders_and_fills_missing_columns() {
        let a = chunk(
            &[("x", ColumnKind::String), ("y", ColumnKind::String)],
            vec![vec![Value::from("x1"), Value::from("y1")]],
        );
        let b = chunk(&[("y", ColumnKind::String)], vec![vec![Value::from("y2")]]);
        let out = assemble("t", chunked(vec![a, b])).unwrap();
        assert_eq!(out.batch.column_names(), vec!["x", "y"]);
        assert_eq!(out.batch.rows[1], vec![Value::Null, Value::from("y2")]);
        assert!(out.batch.check_shape());
    }

    #[test]
    fn test_extra_column_is_schema_mismatch() {
        let a = chunk(&[("x", ColumnKind::String)], vec![]);
        let b = chunk(&[("x", ColumnKind::String), ("z", ColumnKind::String)], vec![]);
        let err = assemble("flights", chunked(vec![a.clone(), a, b])).unwrap_err();
        match err {
            EtlError::SchemaMismatch {
                dataset,
                chunk,
                column,
            } => {
                assert_eq!(dataset, "flights");
                assert_eq!(chunk, 2);
                assert_eq!(column, "z");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_widens_kinds_across_chunks() {
        let a = chunk(&[("d", ColumnKind::Integer)], vec![vec![Value::Int(5)]]);
        let b = chunk(&[("d", ColumnKind::Float)], vec![vec![Value::Float(2.5)]]);
        let out = assemble("t", chunked(vec![a, b])).unwrap();
        assert_eq!(out.batch.columns[0].kind, ColumnKind::Float);
        assert_eq!(out.batch.rows[0][0], Value::Float(5.0));
    }

    #[test]
    fn test_zero_chunks_is_empty_batch() {
        let out = assemble("airports", chunked(vec![])).unwrap();
        assert_eq!(out.chunks, 0);
        assert_eq!(out.batch.column_count(), 0);
        assert!(out.batch.is_empty());
    }
}
