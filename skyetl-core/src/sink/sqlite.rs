//! SQLite sink backed by `rusqlite`.

use super::{Sink, quote_ident};
use crate::data::batch::Chunk;
use crate::data::schema::Value;
use crate::error::{EtlError, Result};
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Bool(b) => ToSqlOutput::from(*b),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Float(f) => ToSqlOutput::from(*f),
            Value::Str(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// Writes chunks into a SQLite database, one transaction per call.
pub struct SqliteSink {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteSink {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EtlError::sink_unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(&path).map_err(|e| {
            EtlError::sink_unavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        Ok(Self::with_connection(conn, format!("sqlite://{}", path.display())))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            EtlError::sink_unavailable(format!("cannot open in-memory database: {e}"))
        })?;
        Ok(Self::with_connection(conn, "sqlite::memory:".into()))
    }

    fn with_connection(conn: Connection, location: String) -> Self {
        Self {
            conn: Mutex::new(conn),
            location,
        }
    }

    /// Database file path for file-backed sinks.
    pub fn path(&self) -> Option<&Path> {
        self.location.strip_prefix("sqlite://").map(Path::new)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EtlError::sink_unavailable("sqlite connection lock poisoned"))
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    fn in_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn create_table(tx: &Transaction<'_>, table: &str, chunk: &Chunk<'_>) -> Result<()> {
    let columns = chunk
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
    tx.execute(&format!("CREATE TABLE {} ({columns})", quote_ident(table)), [])?;
    Ok(())
}

fn insert_rows(tx: &Transaction<'_>, table: &str, chunk: &Chunk<'_>) -> Result<()> {
    if chunk.columns.is_empty() {
        return Ok(());
    }
    let names = chunk
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=chunk.columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = tx.prepare(&format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders})",
        quote_ident(table)
    ))?;
    for row in chunk.rows {
        stmt.execute(rusqlite::params_from_iter(row.iter()))?;
    }
    Ok(())
}

impl Sink for SqliteSink {
    fn describe(&self) -> String {
        self.location.clone()
    }

    fn ping(&self) -> Result<String> {
        let conn = self.lock()?;
        let version: String = conn
            .query_row("SELECT sqlite_version()", [], |r| r.get(0))
            .map_err(|e| EtlError::sink_unavailable(format!("{}: {e}", self.location)))?;
        Ok(format!("SQLite {version}"))
    }

    fn replace_table(&self, table: &str, chunk: &Chunk<'_>) -> Result<()> {
        self.in_transaction(|tx| {
            create_table(tx, table, chunk)?;
            insert_rows(tx, table, chunk)
        })
    }

    fn append_table(&self, table: &str, chunk: &Chunk<'_>) -> Result<()> {
        self.in_transaction(|tx| insert_rows(tx, table, chunk))
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
        Ok(())
    }

    fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.in_transaction(|tx| {
            tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(to)), [])?;
            tx.execute(
                &format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to)),
                [],
            )?;
            Ok(())
        })
    }
}
