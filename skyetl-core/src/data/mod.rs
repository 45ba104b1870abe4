//! Tabular data model and the extract/clean/enrich stages that operate on it.

pub mod assemble;
pub mod batch;
pub mod clean;
pub mod enrich;
pub mod registry;
pub mod schema;
pub mod source;

pub use assemble::{Assembled, ChunkAssembler, assemble};
pub use batch::{Batch, Chunk, Row};
pub use clean::{CleaningReport, StreamingCleaner, clean};
pub use enrich::{Enricher, merge};
pub use registry::{
    AIRLINES, AIRPORTS, Bounds, CleaningRules, DatasetDefinition, DatasetRegistry, DatasetRole,
    FLIGHTS, JoinSpec,
};
pub use schema::{Column, ColumnKind, Value};
pub use source::{ChunkIter, CsvSource, SourceConfig, SourceReader, SourceShape, SqliteSource};
