//! Declarative schema definitions: table bases, tables, columns and views.
//!
//! A [`TableBase`] owns the [`SchemaMetadata`] that tables and views are
//! registered against before materialization. The two built-in bases are
//! process-wide and differ in how timestamps cross the storage boundary and
//! how table names are derived from type names.

use crate::error::{DbBootError, DbResult};
use crate::models::catalog::RelationKind;
use crate::models::value::{Record, Row, Value};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

/// How timestamp columns are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimezoneHandling {
    /// Timezone-naive columns. Values are written as naive UTC and read back
    /// with UTC attached.
    Naive,
    /// Timezone-aware columns. Values pass through unchanged.
    Aware,
}

impl TimezoneHandling {
    /// Derive a table name from a type name.
    ///
    /// Naive bases use snake case (`DBTestDate` -> `db_test_date`), aware
    /// bases lower-case and append `s` (`DBTestDate` -> `dbtestdates`).
    pub fn table_name(&self, type_name: &str) -> String {
        match self {
            Self::Naive => camel_to_snake_case(type_name),
            Self::Aware => pluralize_lowercase(type_name),
        }
    }

    /// Convert an application value for storage.
    pub fn bind(&self, value: Value) -> Value {
        match (self, value) {
            (Self::Naive, Value::Timestamp(ts)) => Value::NaiveTimestamp(ts.naive_utc()),
            (_, value) => value,
        }
    }

    /// Convert a stored value for the application.
    pub fn result(&self, value: Value) -> Value {
        match (self, value) {
            (Self::Naive, Value::NaiveTimestamp(naive)) => {
                Value::Timestamp(naive.and_utc().fixed_offset())
            }
            (Self::Naive, Value::Timestamp(ts)) => {
                Value::Timestamp(ts.with_timezone(&Utc).fixed_offset())
            }
            (_, value) => value,
        }
    }
}

/// Convert a `CamelCase` name to `snake_case`.
///
/// An underscore is inserted before an upper-case letter that follows a
/// lower-case letter or digit, and before an upper-case letter that starts a
/// new word inside an acronym run (`DBTest` -> `db_test`).
pub fn camel_to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || next_is_lower {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }

    out.trim_start_matches('_').to_string()
}

/// Lower-case a name and append `s`.
pub fn pluralize_lowercase(name: &str) -> String {
    format!("{}s", name.to_lowercase())
}

/// Quote an SQL identifier with double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column type for declared tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnType {
    Integer,
    BigInteger,
    Text,
    Real,
    Boolean,
    Timestamp,
    Blob,
}

impl ColumnType {
    /// DDL type name for a dialect.
    pub fn sql_type(&self, dialect: &str, handling: TimezoneHandling) -> &'static str {
        let postgres = dialect == "postgresql";
        match self {
            Self::Integer => "INTEGER",
            Self::BigInteger => "BIGINT",
            Self::Text => "TEXT",
            Self::Real if postgres => "DOUBLE PRECISION",
            Self::Real => "REAL",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp if !postgres => "DATETIME",
            Self::Timestamp => match handling {
                TimezoneHandling::Naive => "TIMESTAMP WITHOUT TIME ZONE",
                TimezoneHandling::Aware => "TIMESTAMP WITH TIME ZONE",
            },
            Self::Blob if postgres => "BYTEA",
            Self::Blob => "BLOB",
        }
    }
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
}

impl ColumnDef {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, primary_key: false, nullable: true }
    }

    /// Mark the column as (part of) the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// A declared table bound to the timezone handling of its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub handling: TimezoneHandling,
}

impl TableDef {
    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for a dialect.
    pub fn create_sql(&self, dialect: &str) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut col = format!(
                    "{} {}",
                    quote_ident(&c.name),
                    c.column_type.sql_type(dialect, self.handling)
                );
                if !c.nullable {
                    col.push_str(" NOT NULL");
                }
                col
            })
            .collect();

        let keys: Vec<String> =
            self.columns.iter().filter(|c| c.primary_key).map(|c| quote_ident(&c.name)).collect();
        if !keys.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(&self.name), parts.join(", "))
    }

    /// `DROP TABLE IF EXISTS` statement for `dialect`.
    pub fn drop_sql(&self, dialect: &str) -> String {
        drop_relation_sql(RelationKind::Table, &self.name, dialect)
    }

    /// `SELECT` of every declared column.
    pub fn select_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(&c.name)).collect();
        format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&self.name))
    }

    /// Order a record by declared columns and convert it for storage.
    ///
    /// Fails on keys that are not declared columns.
    pub fn bind_record(&self, record: &Record) -> DbResult<Vec<Value>> {
        if let Some(unknown) = record.columns().find(|k| self.column(k).is_none()) {
            return Err(DbBootError::config(format!(
                "Table {} has no column {unknown}",
                self.name
            )));
        }

        Ok(self
            .columns
            .iter()
            .map(|c| self.handling.bind(record.get(&c.name).cloned().unwrap_or(Value::Null)))
            .collect())
    }

    /// Convert a stored row for the application.
    pub fn decode_row(&self, row: Row) -> Row {
        decode_with(self.handling, row)
    }
}

fn decode_with(handling: TimezoneHandling, row: Row) -> Row {
    let columns: Arc<[String]> = row.columns().to_vec().into();
    let values = row.into_values().into_iter().map(|v| handling.result(v)).collect();
    Row::new(columns, values)
}

/// A query definition a view is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selectable {
    sql: String,
    columns: Vec<ColumnDef>,
    handling: TimezoneHandling,
}

impl Selectable {
    /// Wrap raw SQL whose projection is `columns`.
    pub fn new(sql: impl Into<String>, columns: Vec<ColumnDef>, handling: TimezoneHandling) -> Self {
        Self { sql: sql.into(), columns, handling }
    }

    /// Select every column of a table.
    pub fn from_table(table: &TableDef) -> Self {
        Self { sql: table.select_sql(), columns: table.columns.clone(), handling: table.handling }
    }

    /// Select some columns of a table, in the order given.
    pub fn from_table_columns(table: &TableDef, names: &[&str]) -> DbResult<Self> {
        let columns = names
            .iter()
            .map(|name| {
                table.column(name).cloned().ok_or_else(|| {
                    DbBootError::config(format!("Table {} has no column {name}", table.name))
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        let projection: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let sql = format!("SELECT {} FROM {}", projection.join(", "), quote_ident(&table.name));
        Ok(Self { sql, columns, handling: table.handling })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }
}

/// A view pending materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDef {
    pub name: String,
    pub selectable: Selectable,
}

impl ViewDef {
    /// `CREATE VIEW` statement. Existence is checked by the caller.
    pub fn create_sql(&self) -> String {
        format!("CREATE VIEW {} AS {}", quote_ident(&self.name), self.selectable.sql)
    }

    /// `DROP VIEW` statement for `dialect`. Existence is checked by the caller.
    pub fn drop_sql(&self, dialect: &str) -> String {
        drop_relation_sql(RelationKind::View, &self.name, dialect)
    }
}

/// `DROP` statement for a table or view.
///
/// PostgreSQL refuses to drop a relation that views or foreign keys depend
/// on, so there the statement cascades. A cascade can remove a view that is
/// dropped later in the same pass, hence `IF EXISTS` for views too.
pub fn drop_relation_sql(kind: RelationKind, name: &str, dialect: &str) -> String {
    let name = quote_ident(name);
    match (kind, dialect) {
        (RelationKind::Table, "postgresql") => format!("DROP TABLE IF EXISTS {name} CASCADE"),
        (RelationKind::View, "postgresql") => format!("DROP VIEW IF EXISTS {name} CASCADE"),
        (RelationKind::Table, _) => format!("DROP TABLE IF EXISTS {name}"),
        (RelationKind::View, _) => format!("DROP VIEW {name}"),
    }
}

/// Query handle for a registered view.
///
/// Columns mirror the projection of the selectable the view was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHandle {
    name: String,
    columns: Vec<ColumnDef>,
    handling: TimezoneHandling,
}

impl ViewHandle {
    pub(crate) fn new(view: &ViewDef) -> Self {
        Self {
            name: view.name.clone(),
            columns: view.selectable.columns.clone(),
            handling: view.selectable.handling,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// `SELECT` of every view column.
    pub fn select_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(&c.name)).collect();
        format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&self.name))
    }

    /// Convert a stored row for the application, like the source table does.
    pub fn decode_row(&self, row: Row) -> Row {
        decode_with(self.handling, row)
    }
}

#[derive(Debug, Default)]
struct MetadataInner {
    tables: Vec<TableDef>,
    views: Vec<ViewDef>,
}

/// Tables and pending views registered against a base.
///
/// Cloning shares the underlying registry.
#[derive(Debug, Clone, Default)]
pub struct SchemaMetadata {
    inner: Arc<RwLock<MetadataInner>>,
}

impl SchemaMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, replacing one with the same name.
    pub fn add_table(&self, table: TableDef) {
        let mut inner = self.inner.write();
        match inner.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => inner.tables.push(table),
        }
    }

    /// Register a view, replacing one with the same name.
    pub fn add_view(&self, view: ViewDef) {
        let mut inner = self.inner.write();
        match inner.views.iter_mut().find(|v| v.name == view.name) {
            Some(existing) => *existing = view,
            None => inner.views.push(view),
        }
    }

    /// Registered tables in registration order.
    pub fn tables(&self) -> Vec<TableDef> {
        self.inner.read().tables.clone()
    }

    /// Pending views in registration order.
    pub fn views(&self) -> Vec<ViewDef> {
        self.inner.read().views.clone()
    }

    /// Get a registered table by name.
    pub fn table(&self, name: &str) -> Option<TableDef> {
        self.inner.read().tables.iter().find(|t| t.name == name).cloned()
    }

    /// Check whether two handles share a registry.
    pub fn same_registry(&self, other: &SchemaMetadata) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Schema-definition root used for materialization.
#[derive(Debug, Clone)]
pub struct TableBase {
    handling: TimezoneHandling,
    metadata: SchemaMetadata,
}

static NO_TIMEZONE: LazyLock<TableBase> = LazyLock::new(|| TableBase::new(TimezoneHandling::Naive));
static WITH_TIMEZONE: LazyLock<TableBase> =
    LazyLock::new(|| TableBase::new(TimezoneHandling::Aware));

impl TableBase {
    /// Create a base with its own metadata.
    pub fn new(handling: TimezoneHandling) -> Self {
        Self { handling, metadata: SchemaMetadata::new() }
    }

    /// The process-wide timezone-naive base.
    pub fn no_timezone() -> Self {
        NO_TIMEZONE.clone()
    }

    /// The process-wide timezone-aware base.
    pub fn with_timezone() -> Self {
        WITH_TIMEZONE.clone()
    }

    pub fn handling(&self) -> TimezoneHandling {
        self.handling
    }

    pub fn metadata(&self) -> &SchemaMetadata {
        &self.metadata
    }

    /// Check whether both handles refer to the same base.
    pub fn same_base(&self, other: &TableBase) -> bool {
        self.handling == other.handling && self.metadata.same_registry(&other.metadata)
    }

    /// Table name this base derives from a type name.
    pub fn table_name(&self, type_name: &str) -> String {
        self.handling.table_name(type_name)
    }

    /// Declare a table named after `type_name` and register it.
    pub fn define_table(&self, type_name: &str, columns: Vec<ColumnDef>) -> TableDef {
        self.define_table_named(self.table_name(type_name), columns)
    }

    /// Declare a table with an explicit name and register it.
    pub fn define_table_named(&self, name: impl Into<String>, columns: Vec<ColumnDef>) -> TableDef {
        let table = TableDef { name: name.into(), columns, handling: self.handling };
        self.metadata.add_table(table.clone());
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, TimeZone};

    #[test]
    fn test_table_naming_per_base() {
        assert_eq!(camel_to_snake_case("DBTestDate"), "db_test_date");
        assert_eq!(camel_to_snake_case("HTTPResponse2Code"), "http_response2_code");
        assert_eq!(camel_to_snake_case("simple"), "simple");
        assert_eq!(pluralize_lowercase("DBTestDate"), "dbtestdates");

        let base = TableBase::new(TimezoneHandling::Naive);
        assert_eq!(base.table_name("DBTestDate"), "db_test_date");
        let base = TableBase::new(TimezoneHandling::Aware);
        assert_eq!(base.table_name("DBTestDate"), "dbtestdates");
    }

    #[test]
    fn test_naive_base_converts_timestamps() {
        let paris = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = paris.with_ymd_and_hms(2022, 10, 21, 0, 35, 55).unwrap();
        let naive_utc =
            NaiveDate::from_ymd_opt(2022, 10, 20).unwrap().and_hms_opt(22, 35, 55).unwrap();

        let bound = TimezoneHandling::Naive.bind(Value::Timestamp(local));
        assert_eq!(bound, Value::NaiveTimestamp(naive_utc));

        let read = TimezoneHandling::Naive.result(bound);
        let ts = read.as_timestamp().unwrap();
        assert_eq!(ts, local);
        assert_eq!(ts.offset().local_minus_utc(), 0);

        let aware = TimezoneHandling::Aware.bind(Value::Timestamp(local));
        assert_eq!(aware.as_timestamp().unwrap().offset().local_minus_utc(), 7200);
    }

    #[test]
    fn test_table_ddl_and_bind() {
        let base = TableBase::new(TimezoneHandling::Naive);
        let table = base.define_table(
            "DBTestDate",
            vec![ColumnDef::new("test_date", ColumnType::Timestamp).primary_key()],
        );
        assert_eq!(
            table.create_sql("sqlite"),
            "CREATE TABLE IF NOT EXISTS \"db_test_date\" (\"test_date\" DATETIME NOT NULL, PRIMARY KEY (\"test_date\"))"
        );
        assert!(table.create_sql("postgresql").contains("TIMESTAMP WITHOUT TIME ZONE"));
        assert_eq!(table.drop_sql("sqlite"), "DROP TABLE IF EXISTS \"db_test_date\"");
        assert_eq!(table.drop_sql("postgresql"), "DROP TABLE IF EXISTS \"db_test_date\" CASCADE");
        assert_eq!(base.metadata().tables().len(), 1);

        let now = Utc.with_ymd_and_hms(2022, 10, 20, 22, 35, 55).unwrap();
        let values = table.bind_record(&Record::new().set("test_date", now)).unwrap();
        assert_eq!(values, vec![Value::NaiveTimestamp(now.naive_utc())]);

        assert!(table.bind_record(&Record::new().set("nope", 1)).is_err());
    }

    #[test]
    fn test_selectable_projection_and_view_sql() {
        let base = TableBase::new(TimezoneHandling::Naive);
        let table = base.define_table_named(
            "items",
            vec![
                ColumnDef::new("id", ColumnType::Integer).primary_key(),
                ColumnDef::new("label", ColumnType::Text),
            ],
        );

        let selectable = Selectable::from_table_columns(&table, &["label"]).unwrap();
        assert_eq!(selectable.sql(), "SELECT \"label\" FROM \"items\"");
        assert!(Selectable::from_table_columns(&table, &["missing"]).is_err());

        let view = ViewDef { name: "labels".into(), selectable };
        assert_eq!(view.create_sql(), "CREATE VIEW \"labels\" AS SELECT \"label\" FROM \"items\"");
        assert_eq!(view.drop_sql("sqlite"), "DROP VIEW \"labels\"");
        assert_eq!(view.drop_sql("postgresql"), "DROP VIEW IF EXISTS \"labels\" CASCADE");

        let handle = ViewHandle::new(&view);
        assert_eq!(handle.columns().len(), 1);
        assert_eq!(handle.select_sql(), "SELECT \"label\" FROM \"labels\"");
    }

    #[test]
    fn test_builtin_bases_are_shared() {
        assert!(TableBase::no_timezone().same_base(&TableBase::no_timezone()));
        assert!(!TableBase::no_timezone().same_base(&TableBase::with_timezone()));
        assert!(!TableBase::new(TimezoneHandling::Naive).same_base(&TableBase::no_timezone()));
    }
}
