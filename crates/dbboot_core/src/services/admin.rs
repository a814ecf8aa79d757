//! Schema reset and removal.
//!
//! Both operations report success as a boolean. Failures are logged and never
//! raised, so a job can decide for itself whether a failed reset is fatal.

use crate::error::DbResult;
use crate::models::quote_ident;
use crate::services::engine::{Connection, Engine};
use crate::services::uri;

/// Schema used when none is given.
pub const DEFAULT_SCHEMA: &str = "public";

/// Drop `schema` with everything in it, then create it again.
///
/// Runs on one connection and commits after each statement.
pub fn reset_schema(engine: &dyn Engine, schema: &str) -> bool {
    let statements = [
        format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)),
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)),
    ];
    report(engine, schema, "reset", &statements)
}

/// Drop `schema` with everything in it.
pub fn drop_schema(engine: &dyn Engine, schema: &str) -> bool {
    let statements = [format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema))];
    report(engine, schema, "drop", &statements)
}

fn report(engine: &dyn Engine, schema: &str, action: &str, statements: &[String]) -> bool {
    match run_committed(engine, statements) {
        Ok(()) => {
            tracing::info!(schema, action, "Schema updated");
            true
        }
        Err(e) => {
            tracing::warn!(
                schema,
                action,
                uri = %uri::redact(engine.url()),
                error = %e,
                "Schema update failed"
            );
            false
        }
    }
}

fn run_committed(engine: &dyn Engine, statements: &[String]) -> DbResult<()> {
    let mut conn = engine.connect()?;
    let result = execute_each(conn.as_mut(), statements);
    if result.is_err() {
        if let Err(e) = conn.rollback() {
            tracing::debug!(error = %e, "Rollback after failed schema update failed");
        }
    }
    let closed = conn.close();
    result.and(closed)
}

fn execute_each(conn: &mut dyn Connection, statements: &[String]) -> DbResult<()> {
    for sql in statements {
        conn.execute(sql)?;
        conn.commit()?;
    }
    Ok(())
}
