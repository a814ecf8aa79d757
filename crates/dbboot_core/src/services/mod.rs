//! Service layer for dbboot.
//!
//! - `uri` - Connection URI encoding and decoding
//! - `readiness` - Wait for PostgreSQL to accept connections
//! - `tunnel` - SSH port forwarding
//! - `engine` - Engine/connection seams and the default factory
//! - `postgres` / `sqlite` - Engine implementations
//! - `admin` - Schema reset and drop
//! - `restore` - pg_restore runner
//! - `views` - View registration and schema materialization

pub mod admin;
pub mod engine;
pub mod readiness;
pub mod restore;
pub mod tunnel;
pub mod uri;
pub mod views;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use admin::{drop_schema, reset_schema, DEFAULT_SCHEMA};
pub use engine::{create_engine, Connection, DefaultEngineFactory, Engine, EngineFactory};
pub use readiness::{wait_until_ready, PostgresProbe, Probe, ReadinessProber};
pub use restore::Restorer;
pub use tunnel::{SshTunnelService, Tunnel, TunnelOpener};
pub use views::ViewSpec;

#[cfg(feature = "postgres")]
pub use postgres::PostgresEngine;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEngine;
