//! PostgreSQL sink backed by an `sqlx` connection pool.
//!
//! The [`Sink`] trait is synchronous and is only called from the blocking
//! pool, so each call drives its query on the runtime captured at connect
//! time with `Handle::block_on`.

use super::{ConnectionDescriptor, Sink, quote_ident};
use crate::data::batch::{Chunk, Row};
use crate::data::schema::{Column, ColumnKind, Value};
use crate::error::{EtlError, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, Postgres};
use sqlx::{PgPool, QueryBuilder};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;

/// Upper bound on bind parameters in one statement (the wire protocol's limit).
const MAX_BIND_PARAMS: usize = 65_535;

const DEFAULT_PORT: u16 = 5432;

pub struct PostgresSink {
    pool: PgPool,
    handle: Handle,
    location: String,
}

impl PostgresSink {
    /// Build a lazily connecting pool for `descriptor` on the current runtime.
    /// Nothing is sent to the server until the first call; `ping` checks reachability.
    pub fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            EtlError::sink_unavailable(format!("{descriptor}: postgres sink needs a Tokio runtime"))
        })?;
        let pool = {
            let _guard = handle.enter();
            PgPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect_lazy_with(connect_options(descriptor))
        };
        Ok(Self {
            pool,
            handle,
            location: descriptor.to_string(),
        })
    }

    fn block_on<T>(&self, fut: impl Future<Output = sqlx::Result<T>>) -> Result<T> {
        Ok(self.handle.block_on(fut)?)
    }

    async fn insert_rows(
        conn: &mut sqlx::PgConnection,
        table: &str,
        chunk: &Chunk<'_>,
    ) -> sqlx::Result<()> {
        if chunk.columns.is_empty() {
            return Ok(());
        }
        for rows in chunk.rows.chunks(rows_per_statement(chunk.columns.len())) {
            let mut query = insert_prefix(table, chunk.columns);
            query.push_values(rows, |mut b, row: &Row| {
                for (col, cell) in chunk.columns.iter().zip(row) {
                    match Bound::new(col.kind, cell) {
                        Bound::Int(v) => b.push_bind(v),
                        Bound::Float(v) => b.push_bind(v),
                        Bound::Bool(v) => b.push_bind(v),
                        Bound::Text(v) => b.push_bind(v),
                    };
                }
            });
            query.build().execute(&mut *conn).await?;
        }
        Ok(())
    }
}

fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(descriptor.host.as_deref().unwrap_or("localhost"))
        .port(descriptor.port.unwrap_or(DEFAULT_PORT));
    if let Some(user) = &descriptor.user {
        options = options.username(user);
    }
    if let Some(password) = &descriptor.password {
        options = options.password(password);
    }
    if !descriptor.database.is_empty() {
        options = options.database(&descriptor.database);
    }
    options
}

fn postgres_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer => "BIGINT",
        ColumnKind::Float => "DOUBLE PRECISION",
        ColumnKind::Boolean => "BOOLEAN",
        ColumnKind::String => "TEXT",
    }
}

fn create_table_sql(table: &str, columns: &[Column]) -> String {
    let columns = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), postgres_type(c.kind)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns})", quote_ident(table))
}

fn insert_prefix(table: &str, columns: &[Column]) -> QueryBuilder<'static, Postgres> {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    QueryBuilder::new(format!("INSERT INTO {} ({names}) ", quote_ident(table)))
}

fn rows_per_statement(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).max(1)
}

/// A cell typed for binding against its column's declared kind. Cells that
/// do not fit the column are sent as text and rejected by the server.
#[derive(Debug, PartialEq)]
enum Bound {
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Text(Option<String>),
}

impl Bound {
    fn new(kind: ColumnKind, cell: &Value) -> Self {
        match cell.clone().convert_to(kind) {
            Ok(Value::Null) => match kind {
                ColumnKind::Integer => Bound::Int(None),
                ColumnKind::Float => Bound::Float(None),
                ColumnKind::Boolean => Bound::Bool(None),
                ColumnKind::String => Bound::Text(None),
            },
            Ok(Value::Int(i)) => Bound::Int(Some(i)),
            Ok(Value::Float(f)) => Bound::Float(Some(f)),
            Ok(Value::Bool(b)) => Bound::Bool(Some(b)),
            Ok(Value::Str(s)) | Err(Value::Str(s)) => Bound::Text(Some(s)),
            Err(other) => Bound::Text(Some(other.to_string())),
        }
    }
}

impl Sink for PostgresSink {
    fn describe(&self) -> String {
        self.location.clone()
    }

    fn ping(&self) -> Result<String> {
        self.handle
            .block_on(sqlx::query_scalar::<_, String>("SELECT version()").fetch_one(&self.pool))
            .map_err(|e| EtlError::sink_unavailable(format!("{}: {e}", self.location)))
    }

    fn replace_table(&self, table: &str, chunk: &Chunk<'_>) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&create_table_sql(table, chunk.columns))
                .execute(&mut *tx)
                .await?;
            Self::insert_rows(&mut *tx, table, chunk).await?;
            tx.commit().await
        })
    }

    fn append_table(&self, table: &str, chunk: &Chunk<'_>) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            Self::insert_rows(&mut *tx, table, chunk).await?;
            tx.commit().await
        })
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let n = self.block_on(sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool))?;
        Ok(n.max(0) as u64)
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        self.block_on(sqlx::query(&sql).execute(&self.pool))?;
        Ok(())
    }

    fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(to)))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ))
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        })
    }
}
