//! Connection lifecycle management for data-processing jobs.
//!
//! dbboot gets a job from connection parameters to a ready session:
//!
//! - **database**: The bootstrapper ([`Database`], [`DatabaseBuilder`]) and teardown
//! - **session**: A single connection with typed inserts and selects
//! - **models**: Connection parameters, table bases, values and reflected metadata
//! - **services**: URI codec, readiness probing, SSH tunnels, engines, schema
//!   reset, `pg_restore` and view registration
//! - **config**: Bootstrap options loaded from JSON or the environment
//! - **logging**: Structured logging setup

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod runtime;
pub mod services;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::DatabaseConfig;
pub use database::{Database, DatabaseBuilder};
pub use error::{DbBootError, DbResult};
pub use models::{
    ColumnDef, ColumnDetail, ColumnType, ConnectionSpec, Record, ReflectedCatalog,
    ReflectedTable, RelationKind, Row, SchemaMetadata, Selectable, SshAuthMethod, TableBase,
    TableDef, TimezoneHandling, TunnelConfig, Value, ViewHandle,
};
pub use runtime::SharedRuntime;
pub use services::{
    create_engine, drop_schema, reset_schema, wait_until_ready, Connection, Engine,
    EngineFactory, Restorer, Tunnel, TunnelOpener, ViewSpec,
};
pub use session::{Session, SessionState};
