//! Engine and connection seams over the database client libraries.
//!
//! An [`Engine`] knows its URL and dialect and hands out connections; it does
//! not pool. Each [`Connection`] begins a transaction on its first write and
//! keeps it open until [`Connection::commit`].

use crate::error::{DbBootError, DbResult};
use crate::models::{ColumnDetail, Row, Value};
use crate::runtime::SharedRuntime;
use crate::services::uri;
use std::sync::Arc;

/// A database engine: URL, dialect and a connection source.
pub trait Engine: Send + Sync {
    /// Connection URI the engine was created from.
    fn url(&self) -> &str;

    /// Dialect name, e.g. "postgresql" or "sqlite".
    fn dialect(&self) -> &str;

    /// Open a new connection.
    fn connect(&self) -> DbResult<Box<dyn Connection>>;

    /// Release engine resources. Connections already handed out stay usable
    /// until closed.
    fn dispose(&self) -> DbResult<()>;
}

/// A single database connection.
pub trait Connection: Send {
    /// Dialect of the engine this connection belongs to.
    fn dialect(&self) -> &str;

    /// Execute a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str) -> DbResult<u64>;

    /// Run a query and return all rows.
    fn query(&mut self, sql: &str) -> DbResult<Vec<Row>>;

    /// Insert rows into `table` with one batched statement.
    ///
    /// Every row has one value per entry of `columns`.
    fn insert_batch(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>])
        -> DbResult<u64>;

    /// Commit the open transaction, if any.
    fn commit(&mut self) -> DbResult<()>;

    /// Roll back the open transaction, if any.
    fn rollback(&mut self) -> DbResult<()>;

    /// Close the connection. Calling it again is a no-op.
    fn close(&mut self) -> DbResult<()>;

    /// Base tables in the current schema.
    fn table_names(&mut self) -> DbResult<Vec<String>>;

    /// Views in the current schema.
    fn view_names(&mut self) -> DbResult<Vec<String>>;

    /// Columns of a table or view in the current schema, by ordinal.
    fn columns(&mut self, relation: &str) -> DbResult<Vec<ColumnDetail>>;
}

/// Creates engines from connection URIs.
pub trait EngineFactory: Send + Sync {
    fn create(&self, db_uri: &str) -> DbResult<Arc<dyn Engine>>;
}

/// Engine factory dispatching on the URI dialect.
#[derive(Debug, Clone, Default)]
pub struct DefaultEngineFactory {
    runtime: SharedRuntime,
}

impl DefaultEngineFactory {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self { runtime }
    }
}

impl EngineFactory for DefaultEngineFactory {
    fn create(&self, db_uri: &str) -> DbResult<Arc<dyn Engine>> {
        let dialect = uri::dialect_of(db_uri)?;
        let result: DbResult<Arc<dyn Engine>> = match dialect.as_str() {
            #[cfg(feature = "postgres")]
            "postgresql" => Ok(Arc::new(crate::services::postgres::PostgresEngine::new(
                db_uri,
                self.runtime.clone(),
            )?)),
            #[cfg(not(feature = "postgres"))]
            "postgresql" => Err(DbBootError::capability_unavailable("PostgreSQL", "postgres")),
            #[cfg(feature = "sqlite")]
            "sqlite" => Ok(Arc::new(crate::services::sqlite::SqliteEngine::new(db_uri)?)),
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(DbBootError::capability_unavailable("SQLite", "sqlite")),
            other => Err(DbBootError::config(format!("Unsupported dialect: {other}"))),
        };

        match result {
            Ok(engine) => {
                tracing::debug!(uri = %uri::redact(db_uri), dialect = %dialect, "Created engine");
                Ok(engine)
            }
            Err(e) => {
                if matches!(e, DbBootError::CapabilityUnavailable { .. }) {
                    tracing::error!(error = %e, hint = e.hint().unwrap_or_default(), "Cannot create engine");
                }
                Err(e)
            }
        }
    }
}

/// Create an engine with the default factory.
pub fn create_engine(db_uri: &str) -> DbResult<Arc<dyn Engine>> {
    DefaultEngineFactory::default().create(db_uri)
}

/// Placeholder groups for a multi-row `VALUES` clause, numbered from 1.
pub(crate) fn numbered_placeholders(prefix: char, columns: usize, rows: usize) -> String {
    (0..rows)
        .map(|r| {
            let params: Vec<String> =
                (1..=columns).map(|c| format!("{prefix}{}", r * columns + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}
