//! Error types for the skyetl pipeline.
//!
//! Uses `thiserror` for the library error type. Variants follow the stages of a
//! run: source, schema, cleaning/enrichment, sink, configuration.

use std::fmt;

/// Top-level error type for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("Source for '{dataset}' unavailable at {location}: {reason}")]
    SourceUnavailable {
        dataset: String,
        location: String,
        reason: String,
    },

    #[error(
        "Schema mismatch in '{dataset}' chunk {chunk}: \
         column '{column}' not present in first chunk"
    )]
    SchemaMismatch {
        dataset: String,
        chunk: usize,
        column: String,
    },

    #[error("Column '{column}' missing from '{dataset}'")]
    MissingColumn { dataset: String, column: String },

    #[error("Join key '{key}' in column '{column}' of '{dataset}' is not unique")]
    DuplicateJoinKey {
        dataset: String,
        column: String,
        key: String,
    },

    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error(
        "Write of chunk {chunk} into '{table}' failed after {committed} \
         committed chunk(s): {message}"
    )]
    SinkWriteFailed {
        table: String,
        chunk: usize,
        committed: usize,
        message: String,
    },

    #[error("Load of '{table}' incomplete: chunk(s) {failed:?} failed, {committed} committed")]
    PartialLoad {
        table: String,
        failed: Vec<usize>,
        committed: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Stage task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
}

impl EtlError {
    pub fn source_unavailable(
        dataset: impl Into<String>,
        location: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::SourceUnavailable {
            dataset: dataset.into(),
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_column(dataset: impl Into<String>, column: impl Into<String>) -> Self {
        Self::MissingColumn {
            dataset: dataset.into(),
            column: column.into(),
        }
    }

    pub fn sink_unavailable(msg: impl Into<String>) -> Self {
        Self::SinkUnavailable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Pipeline stage in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Clean,
    Enrich,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Extract => write!(f, "extract"),
            Stage::Clean => write!(f, "clean"),
            Stage::Enrich => write!(f, "enrich"),
            Stage::Load => write!(f, "load"),
        }
    }
}

/// An error annotated with where in the run it happened, enough to resume by hand.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed for '{dataset}'{}: {source}", chunk_suffix(.chunk))]
pub struct StageFailure {
    pub dataset: String,
    pub stage: Stage,
    pub chunk: Option<usize>,
    #[source]
    pub source: EtlError,
}

fn chunk_suffix(chunk: &Option<usize>) -> String {
    match chunk {
        Some(ordinal) => format!(" (chunk {ordinal})"),
        None => String::new(),
    }
}

impl StageFailure {
    pub fn new(dataset: impl Into<String>, stage: Stage, source: EtlError) -> Self {
        let chunk = match &source {
            EtlError::SchemaMismatch { chunk, .. } | EtlError::SinkWriteFailed { chunk, .. } => {
                Some(*chunk)
            }
            _ => None,
        };
        Self {
            dataset: dataset.into(),
            stage,
            chunk,
            source,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }
}

pub type Result<T, E = EtlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_picks_up_chunk_ordinal() {
        let failure = StageFailure::new(
            "flights",
            Stage::Load,
            EtlError::SinkWriteFailed {
                table: "flights".into(),
                chunk: 2,
                committed: 2,
                message: "disk full".into(),
            },
        );
        assert_eq!(failure.chunk, Some(2));
        let text = failure.to_string();
        assert!(text.contains("load stage failed for 'flights' (chunk 2)"));
        assert!(text.contains("disk full"));
    }

    #[test]
    fn test_stage_failure_without_chunk() {
        let failure = StageFailure::new(
            "airports",
            Stage::Clean,
            EtlError::missing_column("airports", "CITY"),
        );
        assert_eq!(failure.chunk, None);
        assert_eq!(
            failure.to_string(),
            "clean stage failed for 'airports': Column 'CITY' missing from 'airports'"
        );
    }
}
