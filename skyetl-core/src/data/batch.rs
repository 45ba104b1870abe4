//! The unit of data moving through the pipeline.

use crate::data::schema::{Column, ColumnKind, Value, infer_column_kind, parse_cell};
use serde::{Deserialize, Serialize};

/// One record, positionally aligned with [`Batch::columns`].
pub type Row = Vec<Value>;

/// A named table of rows with typed columns.
///
/// Every row holds exactly `columns.len()` cells; constructors and stages keep
/// that invariant, and [`Batch::check_shape`] verifies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(name: impl Into<String>, columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    /// A batch with no columns and no rows.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    /// Build a batch from raw text cells, inferring each column's kind.
    /// `None` cells are nulls.
    pub fn from_text_rows(
        name: impl Into<String>,
        headers: Vec<String>,
        raw: Vec<Vec<Option<String>>>,
    ) -> Self {
        let kinds: Vec<ColumnKind> = (0..headers.len())
            .map(|i| infer_column_kind(raw.iter().map(|r| r.get(i).and_then(|c| c.as_deref()))))
            .collect();

        let rows = raw
            .into_iter()
            .map(|r| {
                kinds
                    .iter()
                    .enumerate()
                    .map(|(i, kind)| parse_cell(r.get(i).and_then(|c| c.as_deref()), *kind))
                    .collect()
            })
            .collect();

        let columns = headers
            .into_iter()
            .zip(kinds)
            .map(|(name, kind)| Column::new(name, kind))
            .collect();

        Self::new(name, columns, rows)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column values for `name`, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Whether every row has exactly one cell per declared column.
    pub fn check_shape(&self) -> bool {
        let width = self.columns.len();
        self.rows.iter().all(|r| r.len() == width)
    }

    /// Split the rows into consecutive chunks of at most `size` rows.
    /// A `size` of zero is treated as one.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = Chunk<'_>> {
        self.rows
            .chunks(size.max(1))
            .enumerate()
            .map(|(ordinal, rows)| Chunk {
                dataset: &self.name,
                ordinal,
                columns: &self.columns,
                rows,
            })
    }

    /// View the whole batch as a single chunk with the given ordinal.
    pub fn as_chunk(&self, ordinal: usize) -> Chunk<'_> {
        Chunk {
            dataset: &self.name,
            ordinal,
            columns: &self.columns,
            rows: &self.rows,
        }
    }
}

/// A bounded slice of a batch's rows, identified only by its ordinal.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub dataset: &'a str,
    pub ordinal: usize,
    pub columns: &'a [Column],
    pub rows: &'a [Row],
}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: i64) -> Batch {
        Batch::new(
            "t",
            vec![Column::new("n", ColumnKind::Integer)],
            (0..n).map(|i| vec![Value::Int(i)]).collect(),
        )
    }

    #[test]
    fn test_batch_empty() {
        let batch = Batch::empty("flights");
        assert_eq!(batch.row_count(), 0);
        assert_eq!(batch.column_count(), 0);
        assert!(batch.is_empty());
        assert!(batch.check_shape());
    }

    #[test]
    fn test_from_text_rows_infers_kinds() {
        let batch = Batch::from_text_rows(
            "airlines",
            vec!["IATA_CODE".into(), "FLEET".into()],
            vec![
                vec![Some("AA".into()), Some("900".into())],
                vec![Some("DL".into()), None],
            ],
        );
        assert_eq!(batch.columns[0].kind, ColumnKind::String);
        assert_eq!(batch.columns[1].kind, ColumnKind::Integer);
        assert_eq!(batch.rows[1][1], Value::Null);
        assert!(batch.check_shape());
    }

    #[test]
    fn test_chunks_reassemble_in_order() {
        let batch = numbered(25);
        let chunks: Vec<_> = batch.chunks(10).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 5);
        assert_eq!(chunks[1].ordinal, 1);

        let joined: Vec<Row> = chunks.iter().flat_map(|c| c.rows.to_vec()).collect();
        assert_eq!(joined, batch.rows);
    }

    #[test]
    fn test_chunks_of_empty_batch() {
        let batch = Batch::empty("t");
        assert_eq!(batch.chunks(100).count(), 0);
    }
}
