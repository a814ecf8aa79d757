//! PostgreSQL engine on tokio-postgres.
//!
//! Connections are not pooled: every [`Engine::connect`] opens a new client
//! and spawns its connection task on the shared runtime.

use crate::error::{DbBootError, DbResult};
use crate::models::{quote_ident, ColumnDetail, Row, Value};
use crate::runtime::SharedRuntime;
use crate::services::engine::{numbered_placeholders, Connection, Engine};
use crate::services::uri;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

/// Bind parameter limit of the PostgreSQL wire protocol.
const MAX_BIND_PARAMS: usize = 65_535;

/// How long `close` waits for the connection task to finish.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Engine for `postgresql[+driver]://` URIs.
pub struct PostgresEngine {
    url: String,
    config: Config,
    runtime: SharedRuntime,
}

impl PostgresEngine {
    /// Parse the URI. No connection is made until [`Engine::connect`].
    pub fn new(db_uri: &str, runtime: SharedRuntime) -> DbResult<Self> {
        let config = client_config(db_uri)?;
        Ok(Self { url: db_uri.to_string(), config, runtime })
    }
}

/// Client configuration from a decoded connection URI.
///
/// A missing host means `localhost`. Credentials go through [`uri::decode`],
/// so escaped and unescaped `@` in passwords both work.
pub fn client_config(db_uri: &str) -> DbResult<Config> {
    let spec = uri::decode(db_uri, false)?;
    if spec.dialect != "postgresql" {
        return Err(DbBootError::config(format!(
            "Not a PostgreSQL URI: {}",
            uri::redact(db_uri)
        )));
    }

    let mut config = Config::new();
    config.host(spec.host.as_deref().unwrap_or("localhost"));
    if let Some(port) = spec.port {
        config.port(port);
    }
    if let Some(user) = &spec.username {
        config.user(user);
    }
    if let Some(password) = &spec.password {
        config.password(password);
    }
    if let Some(dbname) = &spec.database {
        config.dbname(dbname);
    }
    Ok(config)
}

impl Engine for PostgresEngine {
    fn url(&self) -> &str {
        &self.url
    }

    fn dialect(&self) -> &str {
        "postgresql"
    }

    fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let runtime = self.runtime.get()?;
        let (client, connection) = runtime.block_on(self.config.connect(NoTls))?;

        let task = runtime.spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection error");
            }
        });

        tracing::debug!(uri = %uri::redact(&self.url), "Opened PostgreSQL connection");
        Ok(Box::new(PostgresConnection {
            client: Some(client),
            task: Some(task),
            runtime,
            in_transaction: false,
        }))
    }

    fn dispose(&self) -> DbResult<()> {
        tracing::debug!(uri = %uri::redact(&self.url), "Disposed PostgreSQL engine");
        Ok(())
    }
}

/// One tokio-postgres client.
pub struct PostgresConnection {
    client: Option<Client>,
    task: Option<JoinHandle<()>>,
    runtime: Arc<Runtime>,
    in_transaction: bool,
}

impl PostgresConnection {
    fn client(&self) -> DbResult<&Client> {
        self.client.as_ref().ok_or_else(|| DbBootError::connection("Connection is closed"))
    }

    fn begin_if_needed(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            let client = self.client()?;
            self.runtime.block_on(client.batch_execute("BEGIN"))?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn end_transaction(&mut self, statement: &str) -> DbResult<()> {
        if self.in_transaction {
            let client = self.client()?;
            self.runtime.block_on(client.batch_execute(statement))?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn relation_names(&mut self, kinds: &str) -> DbResult<Vec<String>> {
        let client = self.client()?;
        let sql = format!(
            r#"
            SELECT c.relname AS name
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ({kinds})
              AND n.nspname = current_schema()
            ORDER BY c.relname
            "#
        );
        let rows = self.runtime.block_on(client.query(sql.as_str(), &[]))?;
        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }
}

impl Connection for PostgresConnection {
    fn dialect(&self) -> &str {
        "postgresql"
    }

    fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.begin_if_needed()?;
        let client = self.client()?;
        tracing::debug!(sql, "Executing statement");
        Ok(self.runtime.block_on(client.execute(sql, &[]))?)
    }

    fn query(&mut self, sql: &str) -> DbResult<Vec<Row>> {
        self.begin_if_needed()?;
        let client = self.client()?;
        let statement = self.runtime.block_on(client.prepare(sql))?;
        let columns: Arc<[String]> =
            statement.columns().iter().map(|c| c.name().to_string()).collect::<Vec<_>>().into();
        let decoders: Vec<Decoder> =
            statement.columns().iter().map(|c| Decoder::for_type(c.type_())).collect();

        // Types without a binary decoder are read through the text protocol
        if decoders.contains(&Decoder::TextProtocol) {
            tracing::debug!(sql, "Reading rows as text");
            let messages = self.runtime.block_on(client.simple_query(sql))?;
            return messages
                .iter()
                .filter_map(|message| match message {
                    SimpleQueryMessage::Row(row) => Some(row),
                    _ => None,
                })
                .map(|row| {
                    let values = decoders
                        .iter()
                        .enumerate()
                        .map(|(i, decoder)| {
                            Ok(row.try_get(i)?.map_or(Value::Null, |text| decoder.parse_text(text)))
                        })
                        .collect::<DbResult<Vec<_>>>()?;
                    Ok(Row::new(Arc::clone(&columns), values))
                })
                .collect();
        }

        let rows = self.runtime.block_on(client.query(&statement, &[]))?;
        rows.iter()
            .map(|row| {
                let values = decoders
                    .iter()
                    .zip(statement.columns())
                    .enumerate()
                    .map(|(i, (decoder, column))| decoder.read(row, i, column.type_()))
                    .collect::<DbResult<Vec<_>>>()?;
                Ok(Row::new(Arc::clone(&columns), values))
            })
            .collect()
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
        let client = self.client()?;

        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
        let mut inserted = 0;

        for chunk in rows.chunks(rows_per_statement) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list.join(", "),
                numbered_placeholders('$', columns.len(), chunk.len())
            );
            let params: Vec<&(dyn ToSql + Sync)> =
                chunk.iter().flatten().map(|v| v as &(dyn ToSql + Sync)).collect();
            inserted += self.runtime.block_on(client.execute(sql.as_str(), &params))?;
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
        if self.client.is_none() {
            return Ok(());
        }
        // Uncommitted work is discarded
        let rolled_back = self.rollback();
        self.client = None;

        if let Some(task) = self.task.take() {
            if self.runtime.block_on(tokio::time::timeout(CLOSE_GRACE, task)).is_err() {
                tracing::warn!("Timed out waiting for PostgreSQL connection to close");
            }
        }
        rolled_back
    }

    fn table_names(&mut self) -> DbResult<Vec<String>> {
        self.relation_names("'r', 'p'")
    }

    fn view_names(&mut self) -> DbResult<Vec<String>> {
        self.relation_names("'v', 'm'")
    }

    fn columns(&mut self, relation: &str) -> DbResult<Vec<ColumnDetail>> {
        let client = self.client()?;
        let rows = self.runtime.block_on(client.query(
            r#"
            SELECT
                a.attname AS name,
                pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                NOT a.attnotnull AS is_nullable,
                COALESCE(
                    (SELECT TRUE FROM pg_catalog.pg_constraint c
                     WHERE c.conrelid = a.attrelid
                       AND c.contype = 'p'
                       AND a.attnum = ANY(c.conkey)),
                    FALSE
                ) AS is_primary_key,
                a.attnum::integer AS ordinal_position
            FROM pg_catalog.pg_attribute a
            JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = current_schema()
              AND c.relname = $1
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
            &[&relation],
        ))?;

        Ok(rows
            .into_iter()
            .map(|row| ColumnDetail {
                name: row.get("name"),
                data_type: row.get("data_type"),
                is_nullable: row.get("is_nullable"),
                is_primary_key: row.get("is_primary_key"),
                ordinal_position: row.get("ordinal_position"),
            })
            .collect())
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        // Dropping the client ends the connection task on its own
        self.client = None;
    }
}

/// How values of one column type are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Boolean,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Json,
    Bytes,
    Text,
    /// No binary mapping; the query is rerun over the text protocol
    TextProtocol,
}

impl Decoder {
    fn for_type(ty: &Type) -> Self {
        match *ty {
            Type::BOOL => Self::Boolean,
            Type::INT2 => Self::Int2,
            Type::INT4 => Self::Int4,
            Type::INT8 => Self::Int8,
            Type::OID => Self::Oid,
            Type::FLOAT4 => Self::Float4,
            Type::FLOAT8 => Self::Float8,
            Type::TIMESTAMP => Self::Timestamp,
            Type::TIMESTAMPTZ => Self::TimestampTz,
            Type::DATE => Self::Date,
            Type::TIME => Self::Time,
            Type::JSON | Type::JSONB => Self::Json,
            Type::BYTEA => Self::Bytes,
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => Self::Text,
            _ => Self::TextProtocol,
        }
    }

    /// Read column `i` of a binary-protocol row.
    fn read(self, row: &tokio_postgres::Row, i: usize, ty: &Type) -> DbResult<Value> {
        let type_error = |e: tokio_postgres::Error| {
            DbBootError::database(format!("Cannot decode column {i} of type {}: {e}", ty.name()))
        };
        let value = match self {
            Self::Boolean => row.try_get::<_, Option<bool>>(i).map_err(type_error)?.map(Value::Boolean),
            Self::Int2 => {
                row.try_get::<_, Option<i16>>(i).map_err(type_error)?.map(|v| Value::Integer(v.into()))
            }
            Self::Int4 => {
                row.try_get::<_, Option<i32>>(i).map_err(type_error)?.map(|v| Value::Integer(v.into()))
            }
            Self::Int8 => row.try_get::<_, Option<i64>>(i).map_err(type_error)?.map(Value::Integer),
            Self::Oid => {
                row.try_get::<_, Option<u32>>(i).map_err(type_error)?.map(|v| Value::Integer(v.into()))
            }
            Self::Float4 => {
                row.try_get::<_, Option<f32>>(i).map_err(type_error)?.map(|v| Value::Real(v.into()))
            }
            Self::Float8 => row.try_get::<_, Option<f64>>(i).map_err(type_error)?.map(Value::Real),
            Self::Timestamp => row
                .try_get::<_, Option<NaiveDateTime>>(i)
                .map_err(type_error)?
                .map(Value::NaiveTimestamp),
            Self::TimestampTz => row
                .try_get::<_, Option<DateTime<Utc>>>(i)
                .map_err(type_error)?
                .map(|v| Value::Timestamp(v.fixed_offset())),
            Self::Date => row.try_get::<_, Option<NaiveDate>>(i).map_err(type_error)?.map(Value::Date),
            Self::Time => row.try_get::<_, Option<NaiveTime>>(i).map_err(type_error)?.map(Value::Time),
            Self::Json => row
                .try_get::<_, Option<serde_json::Value>>(i)
                .map_err(type_error)?
                .map(Value::Json),
            Self::Bytes => row.try_get::<_, Option<Vec<u8>>>(i).map_err(type_error)?.map(Value::Blob),
            Self::Text | Self::TextProtocol => {
                row.try_get::<_, Option<String>>(i).map_err(type_error)?.map(Value::Text)
            }
        };
        Ok(value.unwrap_or(Value::Null))
    }

    /// Parse the text-protocol rendering of a value. Text that does not
    /// parse is kept as text.
    fn parse_text(self, text: &str) -> Value {
        let parsed = match self {
            Self::Boolean => match text {
                "t" => Some(Value::Boolean(true)),
                "f" => Some(Value::Boolean(false)),
                _ => None,
            },
            Self::Int2 | Self::Int4 | Self::Int8 | Self::Oid => text.parse().ok().map(Value::Integer),
            Self::Float4 | Self::Float8 => text.parse().ok().map(Value::Real),
            Self::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(Value::NaiveTimestamp),
            Self::TimestampTz => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(Value::Timestamp),
            Self::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(Value::Date),
            Self::Time => NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok().map(Value::Time),
            Self::Json => serde_json::from_str(text).ok().map(Value::Json),
            Self::Bytes => decode_hex_bytea(text).map(Value::Blob),
            Self::Text | Self::TextProtocol => None,
        };
        parsed.unwrap_or_else(|| Value::Text(text.to_string()))
    }
}

/// Decode `bytea` in hex output format (`\x0a1b`).
fn decode_hex_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::BOOL => (*v != 0).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Real(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Text(v) => v.to_sql(ty, out),
            Value::Boolean(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                _ => v.with_timezone(&Utc).to_sql(ty, out),
            },
            Value::NaiveTimestamp(v) => match *ty {
                Type::TIMESTAMPTZ => v.and_utc().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Date(v) => v.to_sql(ty, out),
            Value::Time(v) => v.to_sql(ty, out),
            Value::Json(v) => v.to_sql(ty, out),
            Value::Blob(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
