//! Session bootstrapper.
//!
//! [`DatabaseBuilder::build`] turns connection parameters into a ready
//! [`Database`]: an optional SSH tunnel, a resolved URI, a server that
//! accepts connections, an optional restore and schema reset, a caller hook,
//! and finally a session whose schema is either materialized from the table
//! base or reflected from the live database.

use crate::error::{DbBootError, DbResult};
use crate::models::{
    ConnectionSpec, ReflectedCatalog, ReflectedTable, Record, RelationKind, SchemaMetadata,
    Selectable, TableBase, TableDef, TunnelConfig, ViewHandle,
};
use crate::runtime::SharedRuntime;
use crate::services::engine::{Connection, DefaultEngineFactory, Engine, EngineFactory};
use crate::services::readiness::{PostgresProbe, Probe, ReadinessProber};
use crate::services::restore::Restorer;
use crate::services::tunnel::{SshTunnelService, Tunnel, TunnelOpener};
use crate::services::views::{self, ViewSpec};
use crate::services::{admin, uri, DEFAULT_SCHEMA};
use crate::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const NO_TARGET: &str = "No engine, database uri or connection parameters provided!";

/// Construction parameters for a [`Database`].
///
/// `P` is the type returned by the pre-materialization hook.
pub struct DatabaseBuilder<P = ()> {
    engine: Option<Arc<dyn Engine>>,
    db_uri: Option<String>,
    params: ConnectionSpec,
    db_has_tz: bool,
    table_base: Option<TableBase>,
    reflect: bool,
    recreate_schema: bool,
    schema: String,
    backup_file: Option<PathBuf>,
    prepare: Box<dyn FnOnce() -> P>,
    tunnel: Option<TunnelConfig>,
    runtime: SharedRuntime,
    probe: Option<Arc<dyn Probe>>,
    retry_interval: Option<Duration>,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    tunnel_opener: Option<Arc<dyn TunnelOpener>>,
    restorer: Restorer,
}

impl Default for DatabaseBuilder<()> {
    fn default() -> Self {
        Self {
            engine: None,
            db_uri: None,
            params: ConnectionSpec::default(),
            db_has_tz: false,
            table_base: None,
            reflect: false,
            recreate_schema: false,
            schema: DEFAULT_SCHEMA.to_string(),
            backup_file: None,
            prepare: Box::new(|| ()),
            tunnel: None,
            runtime: SharedRuntime::new(),
            probe: None,
            retry_interval: None,
            engine_factory: None,
            tunnel_opener: None,
            restorer: Restorer::default(),
        }
    }
}

impl DatabaseBuilder<()> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P> DatabaseBuilder<P> {
    /// Use an engine created elsewhere. Readiness is not checked for it and
    /// it is not disposed if bootstrap fails.
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn uri(mut self, db_uri: impl Into<String>) -> Self {
        self.db_uri = Some(db_uri.into());
        self
    }

    /// Connection parameters used when neither an engine nor a URI is given.
    pub fn params(mut self, params: ConnectionSpec) -> Self {
        self.params = params;
        self
    }

    /// Select the with-timezone base when no base is given explicitly.
    pub fn db_has_tz(mut self, db_has_tz: bool) -> Self {
        self.db_has_tz = db_has_tz;
        self
    }

    pub fn table_base(mut self, base: TableBase) -> Self {
        self.table_base = Some(base);
        self
    }

    /// Introspect the live schema instead of creating declared tables.
    pub fn reflect(mut self, reflect: bool) -> Self {
        self.reflect = reflect;
        self
    }

    /// Drop and recreate the schema before anything is created.
    pub fn recreate_schema(mut self, recreate: bool) -> Self {
        self.recreate_schema = recreate;
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Restore this `pg_dump` archive before the engine is created.
    pub fn backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_file = Some(path.into());
        self
    }

    pub fn tunnel(mut self, config: TunnelConfig) -> Self {
        self.tunnel = Some(config);
        self
    }

    /// Share an existing runtime with the engine and tunnel.
    pub fn runtime(mut self, runtime: SharedRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Pause between readiness attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    pub fn tunnel_opener(mut self, opener: Arc<dyn TunnelOpener>) -> Self {
        self.tunnel_opener = Some(opener);
        self
    }

    pub fn restorer(mut self, restorer: Restorer) -> Self {
        self.restorer = restorer;
        self
    }

    /// Run `hook` after the engine exists and before any table is created.
    /// Its result is available from [`Database::prepare_results`].
    pub fn prepare<Q>(self, hook: impl FnOnce() -> Q + 'static) -> DatabaseBuilder<Q> {
        DatabaseBuilder {
            engine: self.engine,
            db_uri: self.db_uri,
            params: self.params,
            db_has_tz: self.db_has_tz,
            table_base: self.table_base,
            reflect: self.reflect,
            recreate_schema: self.recreate_schema,
            schema: self.schema,
            backup_file: self.backup_file,
            prepare: Box::new(hook),
            tunnel: self.tunnel,
            runtime: self.runtime,
            probe: self.probe,
            retry_interval: self.retry_interval,
            engine_factory: self.engine_factory,
            tunnel_opener: self.tunnel_opener,
            restorer: self.restorer,
        }
    }

    /// Bootstrap the connection.
    ///
    /// On failure, anything this call opened is torn down before the error
    /// is returned.
    pub fn build(self) -> DbResult<Database<P>> {
        let mut partial = Partial::default();
        match self.bootstrap(&mut partial) {
            Ok(db) => Ok(db),
            Err(e) => {
                tracing::warn!(category = e.category(), error = %e, "Bootstrap failed");
                partial.teardown();
                Err(e)
            }
        }
    }

    fn bootstrap(self, partial: &mut Partial) -> DbResult<Database<P>> {
        let id = Uuid::new_v4();
        let mut params = self.params;

        if let Some(config) = &self.tunnel {
            let opener = self
                .tunnel_opener
                .unwrap_or_else(|| Arc::new(SshTunnelService::new(self.runtime.clone())));
            let tunnel = opener.open(config).inspect_err(|e| {
                if matches!(e, DbBootError::CapabilityUnavailable { .. }) {
                    tracing::error!(error = %e, "Cannot open SSH tunnel");
                }
            })?;
            params.host = Some(tunnel.bound_host().to_string());
            params.port = Some(tunnel.bound_port());
            partial.tunnel = Some(tunnel);
        }

        let db_uri = match (&self.engine, self.db_uri) {
            (_, Some(db_uri)) => Some(db_uri),
            (Some(_), None) => None,
            (None, None) => {
                let encoded = uri::encode(&params, true);
                if encoded.is_empty() {
                    return Err(DbBootError::config(NO_TARGET));
                }
                Some(encoded)
            }
        };

        if self.engine.is_none() {
            if let Some(db_uri) = &db_uri {
                if uri::dialect_of(db_uri)? == "postgresql" {
                    let probe = self
                        .probe
                        .unwrap_or_else(|| Arc::new(PostgresProbe::new(self.runtime.clone())));
                    let mut prober = ReadinessProber::new(probe);
                    if let Some(interval) = self.retry_interval {
                        prober = prober.with_retry_interval(interval);
                    }
                    prober.wait_until_ready(db_uri)?;
                }
            }
        }

        if let Some(backup_file) = &self.backup_file {
            let target = db_uri.as_deref().or(self.engine.as_ref().map(|e| e.url()));
            if let Some(target) = target {
                self.restorer.restore(target, backup_file)?;
            }
        }

        let base = match self.table_base {
            Some(base) => base,
            None if self.db_has_tz => TableBase::with_timezone(),
            None => TableBase::no_timezone(),
        };

        let engine = match self.engine {
            Some(engine) => engine,
            None => {
                let db_uri = db_uri.as_deref().ok_or_else(|| DbBootError::config(NO_TARGET))?;
                let factory = self
                    .engine_factory
                    .unwrap_or_else(|| Arc::new(DefaultEngineFactory::new(self.runtime.clone())));
                let engine = factory.create(db_uri)?;
                partial.engine = Some(Arc::clone(&engine));
                engine
            }
        };
        tracing::info!(%id, uri = %uri::redact(engine.url()), "Engine ready");

        if self.recreate_schema {
            let reset = admin::reset_schema(engine.as_ref(), &self.schema);
            tracing::info!(schema = %self.schema, reset, "Schema recreation finished");
        }

        let prepare_results = (self.prepare)();

        let mut session = Session::new(engine.connect()?);
        let reflected = {
            let conn = session.connection();
            let outcome = conn.and_then(|conn| {
                if self.reflect {
                    reflect_catalog(conn).map(Some)
                } else {
                    views::create_all(conn, base.metadata()).map(|()| None)
                }
            });
            match outcome {
                Ok(reflected) => reflected,
                Err(e) => {
                    if let Err(close_err) = session.close() {
                        tracing::warn!(error = %close_err, "Failed to close session");
                    }
                    return Err(e);
                }
            }
        };

        if let Some(catalog) = &reflected {
            tracing::info!(%id, relations = catalog.len(), "Reflected database schema");
        }

        let tunnel = partial.tunnel.take();
        partial.engine = None;
        Ok(Database {
            id,
            engine,
            session,
            base,
            reflected,
            prepare_results,
            tunnel,
            closed: false,
            _runtime: self.runtime,
        })
    }
}

/// Resources opened by a bootstrap that has not finished yet.
#[derive(Default)]
struct Partial {
    tunnel: Option<Box<dyn Tunnel>>,
    engine: Option<Arc<dyn Engine>>,
}

impl Partial {
    fn teardown(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.dispose() {
                tracing::warn!(error = %e, "Failed to dispose engine after bootstrap failure");
            }
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            if let Err(e) = tunnel.stop() {
                tracing::warn!(error = %e, "Failed to stop SSH tunnel after bootstrap failure");
            }
        }
    }
}

fn reflect_catalog(conn: &mut dyn Connection) -> DbResult<ReflectedCatalog> {
    let mut catalog = ReflectedCatalog::new();
    let relations = conn
        .table_names()?
        .into_iter()
        .map(|name| (name, RelationKind::Table))
        .chain(conn.view_names()?.into_iter().map(|name| (name, RelationKind::View)));

    for (name, kind) in relations.collect::<Vec<_>>() {
        let columns = conn.columns(&name)?;
        tracing::debug!(relation = %name, ?kind, columns = columns.len(), "Reflected relation");
        catalog.insert(ReflectedTable { name, kind, columns });
    }
    Ok(catalog)
}

/// A bootstrapped connection: engine, open session and schema.
///
/// Dropping it closes the session, disposes the engine and stops the tunnel.
pub struct Database<P = ()> {
    id: Uuid,
    engine: Arc<dyn Engine>,
    session: Session,
    base: TableBase,
    reflected: Option<ReflectedCatalog>,
    prepare_results: P,
    tunnel: Option<Box<dyn Tunnel>>,
    closed: bool,
    _runtime: SharedRuntime,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// See [`admin::reset_schema`].
    pub fn reset_schema(engine: &dyn Engine, schema: &str) -> bool {
        admin::reset_schema(engine, schema)
    }

    /// See [`admin::drop_schema`].
    pub fn drop_schema(engine: &dyn Engine, schema: &str) -> bool {
        admin::drop_schema(engine, schema)
    }

    /// Restore a backup with the default `pg_restore`.
    pub fn restore(db_uri: &str, backup_file: impl AsRef<Path>) -> DbResult<String> {
        Restorer::default().restore(db_uri, backup_file)
    }

    pub fn register_view(
        name: &str,
        metadata: &SchemaMetadata,
        selectable: Selectable,
    ) -> ViewHandle {
        views::register(name, metadata, selectable)
    }

    pub fn register_views(specs: Vec<ViewSpec>) -> Vec<ViewHandle> {
        views::register_all(specs)
    }
}

impl<P> Database<P> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn table_base(&self) -> &TableBase {
        &self.base
    }

    /// Tables and views found at bootstrap, when reflection was requested.
    pub fn reflected_classes(&self) -> Option<&ReflectedCatalog> {
        self.reflected.as_ref()
    }

    pub fn prepare_results(&self) -> &P {
        &self.prepare_results
    }

    /// Local endpoint of the SSH tunnel, if one is open.
    pub fn tunnel_endpoint(&self) -> Option<(&str, u16)> {
        self.tunnel.as_ref().map(|t| (t.bound_host(), t.bound_port()))
    }

    /// Insert `rows` into `table` in chunks of `batch_size`, then commit once.
    pub fn batch_populate(
        &mut self,
        rows: &[Record],
        table: &TableDef,
        batch_size: usize,
    ) -> DbResult<()> {
        if batch_size == 0 {
            return Err(DbBootError::config("Batch size must be greater than zero"));
        }

        let chunks = rows.len().div_ceil(batch_size).max(1);
        for index in 0..chunks {
            let start = index * batch_size;
            let end = (start + batch_size).min(rows.len());
            let chunk = rows.get(start..end).unwrap_or(&[]);
            self.session.insert_many(table, chunk)?;
        }
        self.session.commit()?;

        tracing::info!(table = %table.name, rows = rows.len(), chunks, "Batch populated");
        Ok(())
    }

    /// Drop every view, then every table, known to this database.
    pub fn drop_all(&mut self) -> DbResult<()> {
        let conn = self.session.connection()?;
        match &self.reflected {
            Some(catalog) => views::drop_reflected(conn, catalog),
            None => views::drop_all(conn, self.base.metadata()),
        }
    }

    /// Close the session, dispose the engine and stop the tunnel.
    ///
    /// Every step is attempted; the first failure is returned. Closing
    /// twice is a no-op.
    pub fn close(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        let mut record = |step: &str, result: DbResult<()>| {
            if let Err(e) = result {
                tracing::warn!(step, error = %e, "Teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        record("session", self.session.close());
        record("engine", self.engine.dispose());
        if let Some(tunnel) = self.tunnel.as_mut() {
            record("tunnel", tunnel.stop());
        }

        tracing::info!(id = %self.id, "Database closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl<P> Drop for Database<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(id = %self.id, error = %e, "Failed to release database resources");
        }
    }
}

impl<P> std::fmt::Debug for Database<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("uri", &uri::redact(self.engine.url()))
            .field("session", &self.session)
            .field("reflected", &self.reflected.as_ref().map(ReflectedCatalog::len))
            .field("tunnel", &self.tunnel_endpoint())
            .finish()
    }
}
