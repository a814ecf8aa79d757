//! Data models for dbboot.
//!
//! - `connection` - ConnectionSpec, TunnelConfig, SshAuthMethod
//! - `schema` - TableBase, TableDef, ColumnDef, views and metadata
//! - `value` - Value, Record, Row
//! - `catalog` - ReflectedCatalog and introspected columns

pub mod catalog;
pub mod connection;
pub mod schema;
pub mod value;

pub use catalog::{ColumnDetail, ReflectedCatalog, ReflectedTable, RelationKind};
pub use connection::{ConnectionSpec, SshAuthMethod, TunnelConfig, DEFAULT_DIALECT};
pub use schema::{
    camel_to_snake_case, drop_relation_sql, pluralize_lowercase, quote_ident, ColumnDef,
    ColumnType, SchemaMetadata, Selectable, TableBase, TableDef, TimezoneHandling, ViewDef,
    ViewHandle,
};
pub use value::{Record, Row, Value};
