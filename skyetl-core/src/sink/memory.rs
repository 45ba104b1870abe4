//! In-process sink. Used for dry runs (`memory://`) and for tests that need to
//! inspect writes or inject write failures.

use super::{Sink, WriteMode};
use crate::data::batch::{Chunk, Row};
use crate::data::schema::Column;
use crate::error::{EtlError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

/// One write call as seen by the sink, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub table: String,
    pub mode: WriteMode,
    pub rows: usize,
    pub ok: bool,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    log: Vec<WriteRecord>,
    /// (table, n): fail the n-th write call (0-based) against `table`.
    faults: HashSet<(String, usize)>,
    writes_per_table: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<State>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` write call (0-based) against `table` fail.
    pub fn fail_write(&self, table: &str, nth: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert((table.to_string(), nth));
        }
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.state.lock().ok()?.tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.state.lock().map(|s| s.log.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| EtlError::sink_unavailable("memory sink lock poisoned"))
    }

    fn apply(&self, table: &str, chunk: &Chunk<'_>, mode: WriteMode) -> Result<()> {
        let mut state = self.lock()?;
        let nth = {
            let counter = state.writes_per_table.entry(table.to_string()).or_default();
            let n = *counter;
            *counter += 1;
            n
        };
        let mut record = WriteRecord {
            table: table.to_string(),
            mode,
            rows: chunk.len(),
            ok: false,
        };

        if state.faults.contains(&(table.to_string(), nth)) {
            state.log.push(record);
            return Err(EtlError::sink_unavailable(format!(
                "injected failure on write {nth} to '{table}'"
            )));
        }

        match mode {
            WriteMode::Replace => {
                state.tables.insert(
                    table.to_string(),
                    MemoryTable {
                        columns: chunk.columns.to_vec(),
                        rows: chunk.rows.to_vec(),
                    },
                );
            }
            WriteMode::Append => {
                let Some(existing) = state.tables.get_mut(table) else {
                    state.log.push(record);
                    return Err(EtlError::sink_unavailable(format!("no such table: {table}")));
                };
                let width = existing.columns.len();
                if width != chunk.columns.len() {
                    state.log.push(record);
                    return Err(EtlError::sink_unavailable(format!(
                        "table '{table}' has {width} columns, chunk has {}",
                        chunk.columns.len()
                    )));
                }
                existing.rows.extend_from_slice(chunk.rows);
            }
        }
        record.ok = true;
        state.log.push(record);
        Ok(())
    }
}

impl Sink for MemorySink {
    fn describe(&self) -> String {
        "memory://".into()
    }

    fn ping(&self) -> Result<String> {
        self.lock()?;
        Ok(format!("memory sink {}", env!("CARGO_PKG_VERSION")))
    }

    fn replace_table(&self, table: &str, chunk: &Chunk<'_>) -> Result<()> {
        self.apply(table, chunk, WriteMode::Replace)
    }

    fn append_table(&self, table: &str, chunk: &Chunk<'_>) -> Result<()> {
        self.apply(table, chunk, WriteMode::Append)
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        self.lock()?
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| EtlError::sink_unavailable(format!("no such table: {table}")))
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.lock()?.tables.remove(table);
        Ok(())
    }

    fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.lock()?;
        let moved = state
            .tables
            .remove(from)
            .ok_or_else(|| EtlError::sink_unavailable(format!("no such table: {from}")))?;
        state.tables.insert(to.to_string(), moved);
        Ok(())
    }
}
