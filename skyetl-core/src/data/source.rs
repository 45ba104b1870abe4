//! Source readers: delimited files and SQL queries, read whole or in chunks.

use crate::data::batch::{Batch, Row};
use crate::data::schema::{Column, ColumnKind, Value};
use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Where a dataset is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Csv {
        path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_null_tokens")]
        null_tokens: Vec<String>,
    },
    Sqlite {
        db_path: PathBuf,
        query: String,
    },
}

fn default_delimiter() -> char {
    ','
}

/// Cell texts treated as missing values, in addition to the empty string.
pub fn default_null_tokens() -> Vec<String> {
    ["NA", "N/A", "n/a", "NaN", "nan", "-NaN", "-nan", "NULL", "null", "None", "#N/A", "<NA>"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl SourceConfig {
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        SourceConfig::Csv {
            path: path.into(),
            delimiter: default_delimiter(),
            null_tokens: default_null_tokens(),
        }
    }

    /// Resolve relative file paths against `base`.
    pub fn resolved(&self, base: &Path) -> SourceConfig {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        match self {
            SourceConfig::Csv {
                path,
                delimiter,
                null_tokens,
            } => SourceConfig::Csv {
                path: join(path),
                delimiter: *delimiter,
                null_tokens: null_tokens.clone(),
            },
            SourceConfig::Sqlite { db_path, query } => SourceConfig::Sqlite {
                db_path: join(db_path),
                query: query.clone(),
            },
        }
    }

    /// Construct the reader for `dataset`.
    pub fn reader(&self, dataset: &str) -> Box<dyn SourceReader> {
        match self {
            SourceConfig::Csv {
                path,
                delimiter,
                null_tokens,
            } => Box::new(CsvSource {
                dataset: dataset.to_string(),
                path: path.clone(),
                delimiter: *delimiter,
                null_tokens: null_tokens.clone(),
            }),
            SourceConfig::Sqlite { db_path, query } => Box::new(SqliteSource {
                dataset: dataset.to_string(),
                db_path: db_path.clone(),
                query: query.clone(),
            }),
        }
    }
}

/// Ordered sequence of row-chunks for one dataset.
pub type ChunkIter = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// The two shapes a source can deliver. Consumed by the chunk assembler.
pub enum SourceShape {
    Single(Batch),
    Chunked(ChunkIter),
}

impl std::fmt::Debug for SourceShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceShape::Single(batch) => f.debug_tuple("Single").field(&batch.name).finish(),
            SourceShape::Chunked(_) => f.write_str("Chunked(..)"),
        }
    }
}

/// Trait for reading one dataset from a source.
pub trait SourceReader: Send + Sync {
    /// Human-readable location, used in logs and errors.
    fn location(&self) -> String;

    /// Open the source as an ordered sequence of chunks of at most `chunk_size` rows.
    fn read_chunks(&self, chunk_size: usize) -> Result<ChunkIter>;

    /// Read the whole source into one batch.
    fn read_all(&self) -> Result<Batch>;

    /// Open in the requested shape.
    fn open(&self, chunk_size: Option<usize>) -> Result<SourceShape> {
        match chunk_size {
            Some(size) => Ok(SourceShape::Chunked(self.read_chunks(size)?)),
            None => Ok(SourceShape::Single(self.read_all()?)),
        }
    }
}

// ---------------------------------------------------------------------------
// CsvSource
// ---------------------------------------------------------------------------

/// Delimited text file with a header row.
///
/// Fields that are not valid UTF-8 are decoded as Latin-1. Rows with the wrong
/// number of fields, or that the CSV parser rejects, are skipped and counted.
pub struct CsvSource {
    pub dataset: String,
    pub path: PathBuf,
    pub delimiter: char,
    pub null_tokens: Vec<String>,
}

impl CsvSource {
    fn open_reader(&self) -> Result<(csv::Reader<BufReader<File>>, Vec<String>)> {
        let file = File::open(&self.path).map_err(|e| {
            EtlError::source_unavailable(&self.dataset, self.path.display().to_string(), e)
        })?;
        let delimiter = u8::try_from(self.delimiter).map_err(|_| {
            EtlError::config(format!(
                "delimiter {:?} for '{}' is not a single byte",
                self.delimiter, self.dataset
            ))
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(BufReader::new(file));
        let headers = reader
            .byte_headers()
            .map_err(|e| {
                EtlError::source_unavailable(&self.dataset, self.path.display().to_string(), e)
            })?
            .iter()
            .map(|h| decode_bytes(h).trim().to_string())
            .collect();
        Ok((reader, headers))
    }
}

impl SourceReader for CsvSource {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn read_chunks(&self, chunk_size: usize) -> Result<ChunkIter> {
        let (reader, headers) = self.open_reader()?;
        Ok(Box::new(CsvChunks {
            dataset: self.dataset.clone(),
            reader,
            headers,
            null_tokens: self.null_tokens.clone(),
            chunk_size: chunk_size.max(1),
            record: csv::ByteRecord::new(),
            ordinal: 0,
            skipped: 0,
            done: false,
        }))
    }

    fn read_all(&self) -> Result<Batch> {
        let mut chunks = self.read_chunks(usize::MAX)?;
        match chunks.next() {
            Some(batch) => batch,
            None => Ok(Batch::empty(&self.dataset)),
        }
    }
}

/// Chunk iterator over an open CSV reader.
struct CsvChunks {
    dataset: String,
    reader: csv::Reader<BufReader<File>>,
    headers: Vec<String>,
    null_tokens: Vec<String>,
    chunk_size: usize,
    record: csv::ByteRecord,
    ordinal: usize,
    skipped: usize,
    done: bool,
}

impl CsvChunks {
    fn decode_cell(&self, raw: &[u8]) -> Option<String> {
        if raw.is_empty() {
            return None;
        }
        let text = decode_bytes(raw);
        if self.null_tokens.iter().any(|t| t == text.trim()) {
            None
        } else {
            Some(text)
        }
    }
}

impl Iterator for CsvChunks {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.headers.is_empty() {
            return None;
        }

        let width = self.headers.len();
        let mut raw: Vec<Vec<Option<String>>> = Vec::new();
        while raw.len() < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {
                    if self.record.len() != width {
                        self.skipped += 1;
                        tracing::debug!(
                            dataset = %self.dataset,
                            line = self.record.position().map(|p| p.line()),
                            fields = self.record.len(),
                            expected = width,
                            "Skipping malformed row"
                        );
                        continue;
                    }
                    let row = self.record.iter().map(|f| self.decode_cell(f)).collect();
                    raw.push(row);
                }
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                        self.done = true;
                        return Some(Err(EtlError::Csv(e)));
                    }
                    self.skipped += 1;
                    tracing::debug!(dataset = %self.dataset, error = %e, "Skipping unparsable row");
                }
            }
        }

        if self.done && self.skipped > 0 {
            tracing::warn!(
                dataset = %self.dataset,
                skipped = self.skipped,
                "Skipped malformed rows while reading"
            );
        }

        // The first chunk is always produced so an empty file still yields its header.
        if raw.is_empty() && self.ordinal > 0 {
            return None;
        }

        let ordinal = self.ordinal;
        self.ordinal += 1;
        let batch = Batch::from_text_rows(&self.dataset, self.headers.clone(), raw);
        tracing::info!(
            dataset = %self.dataset,
            chunk = ordinal,
            rows = batch.row_count(),
            "Extracted chunk"
        );
        Some(Ok(batch))
    }
}

/// Decode a field as UTF-8, falling back to Latin-1 so no byte sequence fails.
fn decode_bytes(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

// ---------------------------------------------------------------------------
// SqliteSource
// ---------------------------------------------------------------------------

/// SQLite database source. Rows come from a SQL query.
pub struct SqliteSource {
    pub dataset: String,
    pub db_path: PathBuf,
    pub query: String,
}

impl SqliteSource {
    fn query_rows(&self) -> Result<(Vec<String>, Vec<Row>)> {
        let conn = rusqlite::Connection::open_with_flags(
            &self.db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| {
            EtlError::source_unavailable(&self.dataset, self.db_path.display().to_string(), e)
        })?;
        let mut stmt = conn.prepare(&self.query)?;
        let column_count = stmt.column_count();
        let names: Vec<String> = (0..column_count)
            .map(|i| stmt.column_name(i).map(str::to_string))
            .collect::<std::result::Result<_, _>>()?;

        let mut rows = Vec::new();
        let mut result_rows = stmt.query([])?;
        while let Some(row) = result_rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(n) => Value::Int(n),
                    rusqlite::types::ValueRef::Real(f) => Value::Float(f),
                    rusqlite::types::ValueRef::Text(t) | rusqlite::types::ValueRef::Blob(t) => {
                        Value::Str(decode_bytes(t))
                    }
                };
                values.push(value);
            }
            rows.push(values);
        }
        Ok((names, rows))
    }
}

/// Derive column kinds from already-typed values and widen cells to match.
fn typed_batch(dataset: &str, names: &[String], mut rows: Vec<Row>) -> Batch {
    let kinds: Vec<ColumnKind> = (0..names.len())
        .map(|i| {
            rows.iter()
                .filter_map(|r| match &r[i] {
                    Value::Null => None,
                    Value::Bool(_) => Some(ColumnKind::Boolean),
                    Value::Int(_) => Some(ColumnKind::Integer),
                    Value::Float(_) => Some(ColumnKind::Float),
                    Value::Str(_) => Some(ColumnKind::String),
                })
                .reduce(ColumnKind::unify)
                .unwrap_or(ColumnKind::String)
        })
        .collect();

    for row in &mut rows {
        for (cell, kind) in row.iter_mut().zip(&kinds) {
            *cell = std::mem::replace(cell, Value::Null).widen_to(*kind);
        }
    }

    let columns = names
        .iter()
        .zip(kinds)
        .map(|(n, k)| Column::new(n.clone(), k))
        .collect();
    Batch::new(dataset, columns, rows)
}

impl SourceReader for SqliteSource {
    fn location(&self) -> String {
        format!("{} ({})", self.db_path.display(), self.query)
    }

    fn read_chunks(&self, chunk_size: usize) -> Result<ChunkIter> {
        let (names, rows) = self.query_rows()?;
        let size = chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let part: Vec<Row> = rows.by_ref().take(size).collect();
            chunks.push(Ok(typed_batch(&self.dataset, &names, part)));
        }
        if chunks.is_empty() && !names.is_empty() {
            chunks.push(Ok(typed_batch(&self.dataset, &names, Vec::new())));
        }
        Ok(Box::new(chunks.into_iter()))
    }

    fn read_all(&self) -> Result<Batch> {
        let (names, rows) = self.query_rows()?;
        Ok(typed_batch(&self.dataset, &names, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    fn csv_source(path: PathBuf) -> CsvSource {
        CsvSource {
            dataset: "airlines".into(),
            path,
            delimiter: ',',
            null_tokens: default_null_tokens(),
        }
    }

    #[test]
    fn test_source_config_serde() {
        let src = SourceConfig::csv("flights.csv");
        let json = serde_json::to_string(&src).unwrap();
        assert!(json.contains("\"type\":\"csv\""));
        let parsed: SourceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, src);
    }

    #[test]
    fn test_source_config_resolves_relative_paths() {
        let src = SourceConfig::csv("flights.csv").resolved(Path::new("/data"));
        match src {
            SourceConfig::Csv { path, .. } => assert_eq!(path, PathBuf::from("/data/flights.csv")),
            _ => panic!("expected csv"),
        }
    }

    #[test]
    fn test_csv_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.csv", b"IATA_CODE,AIRLINE\nAA,American\nDL,Delta\n");
        let batch = csv_source(path).read_all().unwrap();
        assert_eq!(batch.column_names(), vec!["IATA_CODE", "AIRLINE"]);
        assert_eq!(batch.row_count(), 2);
        assert_eq!(batch.rows[1][1], Value::from("Delta"));
    }

    #[test]
    fn test_csv_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "a.csv",
            b"IATA_CODE,AIRLINE\nAA,American\nBROKEN\nUA,United,extra\nDL,Delta\n",
        );
        let batch = csv_source(path).read_all().unwrap();
        assert_eq!(batch.row_count(), 2);
    }

    #[test]
    fn test_csv_latin1_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.csv", b"IATA_CODE,AIRLINE\nXX,Caf\xe9 Air\n");
        let batch = csv_source(path).read_all().unwrap();
        assert_eq!(batch.rows[0][1], Value::from("Café Air"));
    }

    #[test]
    fn test_csv_null_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.csv", b"IATA_CODE,AIRLINE\nAA,\nDL,NaN\n");
        let batch = csv_source(path).read_all().unwrap();
        assert!(batch.rows[0][1].is_null());
        assert!(batch.rows[1][1].is_null());
    }

    #[test]
    fn test_csv_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("n\n");
        for i in 0..7 {
            body.push_str(&format!("{i}\n"));
        }
        let path = write_file(&dir, "n.csv", body.as_bytes());
        let chunks: Vec<Batch> = csv_source(path)
            .read_chunks(3)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Batch::row_count).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(chunks[2].rows[0][0], Value::Int(6));
    }

    #[test]
    fn test_csv_empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.csv", b"");
        let mut chunks = csv_source(path).read_chunks(10).unwrap();
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_csv_missing_file_is_source_unavailable() {
        let err = csv_source(PathBuf::from("/nonexistent/a.csv"))
            .read_all()
            .unwrap_err();
        assert!(matches!(err, EtlError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_sqlite_source_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("src.db");
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE airports (code TEXT, elevation INTEGER);
             INSERT INTO airports VALUES ('JFK', 13), ('LAX', 125), ('SFO', NULL);",
        )
        .unwrap();
        drop(conn);

        let src = SqliteSource {
            dataset: "airports".into(),
            db_path: db,
            query: "SELECT code, elevation FROM airports ORDER BY code".into(),
        };
        let chunks: Vec<Batch> = src.read_chunks(2).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].columns[1].kind, ColumnKind::Integer);
        assert_eq!(chunks[0].rows[0][0], Value::from("JFK"));

        let all = src.read_all().unwrap();
        assert_eq!(all.row_count(), 3);
    }
}
