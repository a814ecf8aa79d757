//! Recording test doubles for the engine, tunnel and probe seams.

use crate::error::{DbBootError, DbResult};
use crate::models::{ColumnDetail, Row, TunnelConfig, Value};
use crate::services::engine::{Connection, Engine, EngineFactory};
use crate::services::readiness::Probe;
use crate::services::tunnel::{Tunnel, TunnelOpener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Shared, ordered event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }
}

#[derive(Debug, Default)]
struct MockState {
    tables: Vec<String>,
    views: Vec<String>,
    /// (dependent, dependency) pairs
    dependencies: Vec<(String, String)>,
}

/// In-memory engine that records every call.
#[derive(Clone)]
pub struct MockEngine {
    url: String,
    dialect: String,
    pub log: EventLog,
    /// Statements not containing this text fail.
    fail_unless: Option<String>,
    fail_rollback: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new(url: &str) -> Self {
        let dialect = crate::services::uri::dialect_of(url).unwrap_or_else(|_| "mock".into());
        Self {
            url: url.to_string(),
            dialect,
            log: EventLog::default(),
            fail_unless: None,
            fail_rollback: false,
            state: Arc::default(),
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn failing_unless(mut self, needle: &str) -> Self {
        self.fail_unless = Some(needle.to_string());
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn with_existing_view(self, name: &str) -> Self {
        self.state.lock().views.push(name.to_string());
        self
    }

    pub fn with_existing_table(self, name: &str) -> Self {
        self.state.lock().tables.push(name.to_string());
        self
    }

    /// `dependent` references `dependency` through a view or foreign key.
    /// Dropping `dependency` then fails without `CASCADE`, and a cascade
    /// removes dependent views.
    pub fn with_dependency(self, dependent: &str, dependency: &str) -> Self {
        self.state.lock().dependencies.push((dependent.to_string(), dependency.to_string()));
        self
    }
}

impl Engine for MockEngine {
    fn url(&self) -> &str {
        &self.url
    }

    fn dialect(&self) -> &str {
        &self.dialect
    }

    fn connect(&self) -> DbResult<Box<dyn Connection>> {
        self.log.push("connect");
        Ok(Box::new(MockConnection {
            dialect: self.dialect.clone(),
            log: self.log.clone(),
            fail_unless: self.fail_unless.clone(),
            fail_rollback: self.fail_rollback,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn dispose(&self) -> DbResult<()> {
        self.log.push("engine.dispose");
        Ok(())
    }
}

pub struct MockConnection {
    dialect: String,
    log: EventLog,
    fail_unless: Option<String>,
    fail_rollback: bool,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

fn quoted_name(sql: &str) -> Option<String> {
    let start = sql.find('"')? + 1;
    let len = sql[start..].find('"')?;
    Some(sql[start..start + len].to_string())
}

impl Connection for MockConnection {
    fn dialect(&self) -> &str {
        &self.dialect
    }

    fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.log.push(format!("execute: {sql}"));
        if let Some(needle) = &self.fail_unless {
            if !sql.contains(needle.as_str()) {
                return Err(DbBootError::database(format!("mock failure: {sql}")));
            }
        }

        let mut state = self.state.lock();
        let name = quoted_name(sql).unwrap_or_default();
        if sql.starts_with("CREATE VIEW") {
            state.views.push(name);
        } else if sql.starts_with("CREATE TABLE") && !state.tables.contains(&name) {
            state.tables.push(name);
        } else if sql.starts_with("DROP VIEW") || sql.starts_with("DROP TABLE") {
            let dependents: Vec<String> = state
                .dependencies
                .iter()
                .filter(|(_, on)| *on == name)
                .map(|(dependent, _)| dependent.clone())
                .filter(|d| state.views.contains(d) || state.tables.contains(d))
                .collect();
            if !dependents.is_empty() {
                if !sql.ends_with(" CASCADE") {
                    return Err(DbBootError::database(format!(
                        "cannot drop {name} because other objects depend on it"
                    )));
                }
                state.views.retain(|v| !dependents.contains(v));
            }
            state.dependencies.retain(|(dependent, on)| *on != name && *dependent != name);
            state.views.retain(|v| *v != name);
            state.tables.retain(|t| *t != name);
        }
        Ok(0)
    }

    fn query(&mut self, sql: &str) -> DbResult<Vec<Row>> {
        self.log.push(format!("query: {sql}"));
        Ok(Vec::new())
    }

    fn insert_batch(
        &mut self,
        table: &str,
        _columns: &[String],
        rows: &[Vec<Value>],
    ) -> DbResult<u64> {
        self.log.push(format!("insert: {table} rows={}", rows.len()));
        Ok(rows.len() as u64)
    }

    fn commit(&mut self) -> DbResult<()> {
        self.log.push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.log.push("rollback");
        if self.fail_rollback {
            return Err(DbBootError::database("mock rollback failure"));
        }
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        if !self.closed {
            self.closed = true;
            self.log.push("session.close");
        }
        Ok(())
    }

    fn table_names(&mut self) -> DbResult<Vec<String>> {
        Ok(self.state.lock().tables.clone())
    }

    fn view_names(&mut self) -> DbResult<Vec<String>> {
        Ok(self.state.lock().views.clone())
    }

    fn columns(&mut self, _relation: &str) -> DbResult<Vec<ColumnDetail>> {
        Ok(vec![ColumnDetail {
            name: "id".into(),
            data_type: "INTEGER".into(),
            is_nullable: false,
            is_primary_key: true,
            ordinal_position: 1,
        }])
    }
}

/// Factory handing out [`MockEngine`]s that share one log.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    pub log: EventLog,
    pub created: Arc<Mutex<Vec<String>>>,
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, db_uri: &str) -> DbResult<Arc<dyn Engine>> {
        self.created.lock().push(db_uri.to_string());
        self.log.push("engine.create");
        Ok(Arc::new(MockEngine::new(db_uri).with_log(self.log.clone())))
    }
}

/// Tunnel opener binding to a fixed endpoint.
#[derive(Clone)]
pub struct MockTunnelOpener {
    pub log: EventLog,
    pub bound_host: String,
    pub bound_port: u16,
    pub opened: Arc<Mutex<Vec<TunnelConfig>>>,
}

impl MockTunnelOpener {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            bound_host: "0.0.0.0".into(),
            bound_port: 12345,
            opened: Arc::default(),
        }
    }
}

impl TunnelOpener for MockTunnelOpener {
    fn open(&self, config: &TunnelConfig) -> DbResult<Box<dyn Tunnel>> {
        self.log.push("tunnel.open");
        self.opened.lock().push(config.clone());
        Ok(Box::new(MockTunnel {
            log: self.log.clone(),
            host: self.bound_host.clone(),
            port: self.bound_port,
            stopped: false,
        }))
    }
}

struct MockTunnel {
    log: EventLog,
    host: String,
    port: u16,
    stopped: bool,
}

impl Tunnel for MockTunnel {
    fn bound_host(&self) -> &str {
        &self.host
    }

    fn bound_port(&self) -> u16 {
        self.port
    }

    fn stop(&mut self) -> DbResult<()> {
        if !self.stopped {
            self.stopped = true;
            self.log.push("tunnel.stop");
        }
        Ok(())
    }
}

/// Probe that always succeeds and records the URI.
#[derive(Clone, Default)]
pub struct RecordingProbe {
    pub log: EventLog,
}

impl Probe for RecordingProbe {
    fn probe(&self, uri: &str, _timeout: Duration) -> DbResult<()> {
        self.log.push(format!("probe: {uri}"));
        Ok(())
    }
}
