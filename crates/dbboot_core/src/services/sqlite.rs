//! SQLite engine on rusqlite.
//!
//! Timestamps are stored as text: `YYYY-MM-DD HH:MM:SS.ffffff` for naive
//! values and the same with a `+HH:MM` suffix for values carrying an offset.
//! Text read from `DATE`/`TIME` columns is parsed back into timestamps.

use crate::error::{DbBootError, DbResult};
use crate::models::{quote_ident, ColumnDetail, Row, Value};
use crate::services::engine::{numbered_placeholders, Connection, Engine};
use crate::services::uri;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSqlOutput, ValueRef};
use std::sync::Arc;

/// Host parameter limit of the bundled SQLite.
const MAX_BIND_PARAMS: usize = 32_766;

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const AWARE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

/// Engine for `sqlite:///<path>` URIs.
#[derive(Debug)]
pub struct SqliteEngine {
    url: String,
    path: String,
}

impl SqliteEngine {
    pub fn new(db_uri: &str) -> DbResult<Self> {
        let spec = uri::decode(db_uri, false)?;
        let path = spec
            .database
            .ok_or_else(|| DbBootError::config(format!("No database file in {db_uri}")))?;
        Ok(Self { url: db_uri.to_string(), path })
    }

    /// Database file path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Engine for SqliteEngine {
    fn url(&self) -> &str {
        &self.url
    }

    fn dialect(&self) -> &str {
        "sqlite"
    }

    fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let conn = rusqlite::Connection::open(&self.path)?;
        tracing::debug!(path = %self.path, "Opened SQLite connection");
        Ok(Box::new(SqliteConnection { conn: Some(conn), in_transaction: false }))
    }

    fn dispose(&self) -> DbResult<()> {
        tracing::debug!(path = %self.path, "Disposed SQLite engine");
        Ok(())
    }
}

/// One rusqlite connection.
pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
    in_transaction: bool,
}

impl SqliteConnection {
    fn conn(&self) -> DbResult<&rusqlite::Connection> {
        self.conn.as_ref().ok_or_else(|| DbBootError::storage("Connection is closed", None))
    }

    fn begin_if_needed(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            self.conn()?.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn end_transaction(&mut self, statement: &str) -> DbResult<()> {
        if self.in_transaction {
            self.conn()?.execute_batch(statement)?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn names_of(&self, kind: &str) -> DbResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt.query_map([kind], |row| row.get::<_, String>(0))?;
        Ok(names.collect::<Result<Vec<_>, _>>()?)
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> &str {
        "sqlite"
    }

    fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.begin_if_needed()?;
        tracing::debug!(sql, "Executing statement");
        Ok(self.conn()?.execute(sql, [])? as u64)
    }

    fn query(&mut self, sql: &str) -> DbResult<Vec<Row>> {
        self.begin_if_needed()?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;

        let decl_types: Vec<Option<String>> =
            stmt.columns().iter().map(|c| c.decl_type().map(str::to_uppercase)).collect();
        let columns: Arc<[String]> =
            stmt.column_names().into_iter().map(String::from).collect::<Vec<_>>().into();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let values = decl_types
                .iter()
                .enumerate()
                .map(|(i, decl)| Ok(decode_value(row.get_ref(i)?, decl.as_deref())))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            out.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(out)
    }

    fn insert_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> DbResult<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        self.begin_if_needed()?;
        let conn = self.conn()?;

        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
        let mut inserted = 0u64;

        for chunk in rows.chunks(rows_per_statement) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list.join(", "),
                numbered_placeholders('?', columns.len(), chunk.len())
            );
            inserted += conn.execute(&sql, rusqlite::params_from_iter(chunk.iter().flatten()))?
                as u64;
        }

        tracing::debug!(table, rows = inserted, "Inserted batch");
        Ok(inserted)
    }

    fn commit(&mut self) -> DbResult<()> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.end_transaction("ROLLBACK")
    }

    fn close(&mut self) -> DbResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        let rolled_back = self.rollback();
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| DbBootError::from(e))?;
        }
        rolled_back
    }

    fn table_names(&mut self) -> DbResult<Vec<String>> {
        self.names_of("table")
    }

    fn view_names(&mut self) -> DbResult<Vec<String>> {
        self.names_of("view")
    }

    fn columns(&mut self, relation: &str) -> DbResult<Vec<ColumnDetail>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(relation)))?;
        let columns = stmt.query_map([], |row| {
            let cid: i32 = row.get(0)?;
            let notnull: i64 = row.get(3)?;
            let pk: i64 = row.get(5)?;
            Ok(ColumnDetail {
                name: row.get(1)?,
                data_type: row.get(2)?,
                is_nullable: notnull == 0 && pk == 0,
                is_primary_key: pk > 0,
                ordinal_position: cid + 1,
            })
        })?;
        Ok(columns.collect::<Result<Vec<_>, _>>()?)
    }
}

fn decode_value(value: ValueRef<'_>, decl_type: Option<&str>) -> Value {
    let is_temporal = decl_type.is_some_and(|t| t.contains("DATE") || t.contains("TIME"));
    let is_bool = decl_type.is_some_and(|t| t.contains("BOOL"));

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) if is_bool => Value::Boolean(v != 0),
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if is_temporal {
                if let Some(ts) = parse_timestamp(&text) {
                    return ts;
                }
            }
            Value::Text(text.into_owned())
        }
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

fn parse_timestamp(text: &str) -> Option<Value> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(Value::Timestamp(ts));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(Value::Timestamp(ts));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(Value::NaiveTimestamp)
        .or_else(|| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(Value::Date))
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
            Value::Boolean(v) => ToSqlOutput::from(*v),
            Value::Timestamp(v) => ToSqlOutput::from(v.format(AWARE_FORMAT).to_string()),
            Value::NaiveTimestamp(v) => ToSqlOutput::from(v.format(NAIVE_FORMAT).to_string()),
            Value::Date(v) => ToSqlOutput::from(v.format("%Y-%m-%d").to_string()),
            Value::Time(v) => ToSqlOutput::from(v.format("%H:%M:%S%.f").to_string()),
            Value::Json(v) => ToSqlOutput::from(v.to_string()),
            Value::Blob(v) => ToSqlOutput::from(v.as_slice()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, TimeZone};
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> SqliteEngine {
        let path = dir.path().join("test.db");
        SqliteEngine::new(&format!("sqlite:///{}", path.display())).unwrap()
    }

    #[test]
    fn test_engine_resolves_file_path() {
        let engine = SqliteEngine::new("sqlite:///tests/test_database.db").unwrap();
        assert_eq!(engine.path(), "tests/test_database.db");
        assert_eq!(engine.dialect(), "sqlite");
        assert!(SqliteEngine::new("sqlite://").is_err());
    }

    #[test]
    fn test_insert_query_and_introspect() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut conn = engine.connect().unwrap();

        conn.execute(
            "CREATE TABLE items (id INTEGER NOT NULL, label TEXT, seen DATETIME, ok BOOLEAN, PRIMARY KEY (id))",
        )
        .unwrap();
        conn.execute("CREATE VIEW labels AS SELECT label, seen FROM items").unwrap();

        let seen = NaiveDate::from_ymd_opt(1993, 9, 23).unwrap().and_hms_milli_opt(14, 12, 56, 111).unwrap();
        let columns = vec!["id".to_string(), "label".to_string(), "seen".to_string(), "ok".to_string()];
        let rows = vec![
            vec![Value::Integer(1), Value::from("wfrefds"), Value::NaiveTimestamp(seen), Value::Boolean(true)],
            vec![Value::Integer(2), Value::Null, Value::Null, Value::Boolean(false)],
        ];
        assert_eq!(conn.insert_batch("items", &columns, &rows).unwrap(), 2);
        conn.commit().unwrap();

        let read = conn.query("SELECT id, label, seen, ok FROM items ORDER BY id").unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].get("label"), Some(&Value::from("wfrefds")));
        assert_eq!(read[0].get("seen"), Some(&Value::NaiveTimestamp(seen)));
        assert_eq!(read[0].get("ok"), Some(&Value::Boolean(true)));
        assert_eq!(read[1].get("seen"), Some(&Value::Null));

        let view_rows = conn.query("SELECT seen FROM labels WHERE label IS NOT NULL").unwrap();
        assert_eq!(view_rows[0].get_index(0), Some(&Value::NaiveTimestamp(seen)));

        assert_eq!(conn.table_names().unwrap(), vec!["items"]);
        assert_eq!(conn.view_names().unwrap(), vec!["labels"]);
        let details = conn.columns("items").unwrap();
        assert_eq!(details.len(), 4);
        assert!(details[0].is_primary_key);
        assert_eq!(details[2].data_type, "DATETIME");
        assert_eq!(details[2].ordinal_position, 3);

        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.query("SELECT 1").is_err());
    }

    #[test]
    fn test_uncommitted_work_is_discarded_on_close() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let mut conn = engine.connect().unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)").unwrap();
        conn.commit().unwrap();
        conn.execute("INSERT INTO t (v) VALUES (1)").unwrap();
        conn.close().unwrap();

        let mut conn = engine.connect().unwrap();
        assert!(conn.query("SELECT v FROM t").unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_text_formats() {
        let offset = FixedOffset::east_opt(3600).unwrap();
        let ts = offset.with_ymd_and_hms(2022, 10, 20, 22, 35, 55).unwrap();
        let stored = ts.format(AWARE_FORMAT).to_string();
        assert_eq!(stored, "2022-10-20 22:35:55.000000+01:00");
        assert_eq!(parse_timestamp(&stored), Some(Value::Timestamp(ts)));
        assert!(matches!(
            parse_timestamp("1993-09-23 14:12:56.111000"),
            Some(Value::NaiveTimestamp(_))
        ));
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(
            parse_timestamp("2022-10-20"),
            Some(Value::Date(NaiveDate::from_ymd_opt(2022, 10, 20).unwrap()))
        );
    }
}
