//! Session over a single engine connection.

use crate::error::{DbBootError, DbResult};
use crate::models::{Record, ReflectedTable, Row, TableDef, ViewHandle};
use crate::services::engine::Connection;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing run yet
    Open,
    /// At least one statement has run
    Active,
    /// Closed; every further call fails
    Closed,
}

/// Owns exactly one engine connection.
///
/// Declared tables and views are read through their timezone handling; rows
/// of reflected tables are returned as stored.
pub struct Session {
    conn: Box<dyn Connection>,
    state: SessionState,
}

impl Session {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self { conn, state: SessionState::Open }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn dialect(&self) -> &str {
        self.conn.dialect()
    }

    /// The underlying connection, marking the session active.
    pub fn connection(&mut self) -> DbResult<&mut dyn Connection> {
        if self.state == SessionState::Closed {
            return Err(DbBootError::connection("Session is closed"));
        }
        self.state = SessionState::Active;
        Ok(self.conn.as_mut())
    }

    /// Execute a statement inside the session transaction.
    pub fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.connection()?.execute(sql)
    }

    /// Run a raw query.
    pub fn query(&mut self, sql: &str) -> DbResult<Vec<Row>> {
        self.connection()?.query(sql)
    }

    /// Insert one record into a declared table.
    pub fn insert(&mut self, table: &TableDef, record: &Record) -> DbResult<u64> {
        self.insert_many(table, std::slice::from_ref(record))
    }

    /// Insert records into a declared table with one batched statement.
    pub fn insert_many(&mut self, table: &TableDef, records: &[Record]) -> DbResult<u64> {
        let rows = records.iter().map(|r| table.bind_record(r)).collect::<DbResult<Vec<_>>>()?;
        let columns = table.column_names();
        self.connection()?.insert_batch(&table.name, &columns, &rows)
    }

    /// Every row of a declared table, converted for the application.
    pub fn select_all(&mut self, table: &TableDef) -> DbResult<Vec<Row>> {
        let rows = self.query(&table.select_sql())?;
        Ok(rows.into_iter().map(|row| table.decode_row(row)).collect())
    }

    /// Every row of a registered view, converted like its source table.
    pub fn select_view(&mut self, view: &ViewHandle) -> DbResult<Vec<Row>> {
        let rows = self.query(&view.select_sql())?;
        Ok(rows.into_iter().map(|row| view.decode_row(row)).collect())
    }

    /// Every row of a reflected table or view, as stored.
    pub fn select_reflected(&mut self, table: &ReflectedTable) -> DbResult<Vec<Row>> {
        self.query(&table.select_sql())
    }

    pub fn commit(&mut self) -> DbResult<()> {
        self.connection()?.commit()
    }

    pub fn rollback(&mut self) -> DbResult<()> {
        self.connection()?.rollback()
    }

    /// Close the connection. Uncommitted work is discarded.
    pub fn close(&mut self) -> DbResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.conn.close()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dialect", &self.conn.dialect())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDef, ColumnType, TableBase, TimezoneHandling};
    use crate::services::engine::Engine;
    use crate::testing::MockEngine;

    #[test]
    fn test_session_lifecycle() {
        let engine = MockEngine::new("sqlite:///x.db");
        let mut session = Session::new(engine.connect().unwrap());
        assert_eq!(session.state(), SessionState::Open);

        session.execute("SELECT 1").unwrap();
        assert_eq!(session.state(), SessionState::Active);

        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        assert_eq!(engine.log.count("session.close"), 1);
        assert!(session.execute("SELECT 1").is_err());
    }

    #[test]
    fn test_insert_many_is_one_batch() {
        let base = TableBase::new(TimezoneHandling::Aware);
        let table = base.define_table("Item", vec![ColumnDef::new("id", ColumnType::Integer)]);
        let engine = MockEngine::new("sqlite:///x.db");
        let mut session = Session::new(engine.connect().unwrap());

        let records: Vec<Record> = (0..3).map(|i| Record::new().set("id", i)).collect();
        assert_eq!(session.insert_many(&table, &records).unwrap(), 3);
        assert_eq!(engine.log.events().last().map(String::as_str), Some("insert: items rows=3"));

        assert!(session.insert(&table, &Record::new().set("missing", 1)).is_err());
    }
}
