//! # skyetl Core
//!
//! Extract, transform and load for flight records. Reads the flights, airlines
//! and airports datasets, cleans each one, enriches flights with carrier and
//! airport details, and writes all three tables into a relational sink in
//! bounded chunks.

pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod load;
pub mod pipeline;
pub mod sink;

// Re-export commonly used types at the crate root.
pub use config::{ConfigOverrides, EtlConfig, load_config};
pub use data::{Batch, DatasetRegistry, SourceConfig, SourceShape};
pub use error::{EtlError, Result, Stage, StageFailure};
pub use events::{EventBus, PipelineEvent};
pub use load::{LoadOutcome, LoadPolicy, LoadStage, TableWriter};
pub use pipeline::{Pipeline, RunMode, RunReport, RunState};
pub use sink::{ConnectionDescriptor, MemorySink, Sink, SqliteSink, WriteMode};
