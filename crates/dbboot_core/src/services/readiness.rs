//! Blocking wait for a PostgreSQL server to accept connections.

use crate::error::DbResult;
use crate::runtime::SharedRuntime;
use crate::services::uri;
use std::sync::Arc;
use std::time::Duration;

/// Per-attempt connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause between attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A lightweight connect-and-close attempt.
pub trait Probe: Send + Sync {
    /// Connect to `uri` (no driver suffix) and close again.
    fn probe(&self, uri: &str, timeout: Duration) -> DbResult<()>;
}

/// Probe that opens a real PostgreSQL connection.
#[derive(Debug, Clone, Default)]
pub struct PostgresProbe {
    runtime: SharedRuntime,
}

impl PostgresProbe {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self { runtime }
    }
}

#[cfg(feature = "postgres")]
impl Probe for PostgresProbe {
    fn probe(&self, uri: &str, timeout: Duration) -> DbResult<()> {
        let mut config = crate::services::postgres::client_config(uri)?;
        config.connect_timeout(timeout);

        let runtime = self.runtime.get()?;
        runtime.block_on(async move {
            let connect = config.connect(tokio_postgres::NoTls);
            let (client, connection) = tokio::time::timeout(timeout, connect).await.map_err(|_| {
                crate::error::DbBootError::connection("Timed out connecting to PostgreSQL")
            })??;
            drop(client);
            // Completes once the client is gone and the terminate message is sent
            connection.await?;
            Ok::<(), crate::error::DbBootError>(())
        })
    }
}

#[cfg(not(feature = "postgres"))]
impl Probe for PostgresProbe {
    fn probe(&self, _uri: &str, _timeout: Duration) -> DbResult<()> {
        let _ = &self.runtime;
        let err = crate::error::DbBootError::capability_unavailable("PostgreSQL", "postgres");
        tracing::error!(error = %err, "Cannot probe PostgreSQL");
        Err(err)
    }
}

/// Polls a server until it accepts connections.
///
/// Only unavailable-class failures are retried. Bad credentials, unknown
/// databases and malformed URIs are returned immediately.
#[derive(Clone)]
pub struct ReadinessProber {
    probe: Arc<dyn Probe>,
    connect_timeout: Duration,
    retry_interval: Duration,
}

impl ReadinessProber {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe, connect_timeout: CONNECT_TIMEOUT, retry_interval: RETRY_INTERVAL }
    }

    /// Set the pause between attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Block until the server behind `db_uri` accepts a connection.
    pub fn wait_until_ready(&self, db_uri: &str) -> DbResult<()> {
        let target = uri::strip_driver(db_uri);
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            tracing::info!("Checking for PostgreSQL...");
            match self.probe.probe(&target, self.connect_timeout) {
                Ok(()) => {
                    tracing::info!(attempts, "PostgreSQL is running!");
                    return Ok(());
                }
                Err(e) if e.is_unavailable() => {
                    tracing::debug!(attempts, error = %e, "PostgreSQL not ready yet");
                    std::thread::sleep(self.retry_interval);
                }
                Err(e) => {
                    tracing::warn!(
                        uri = %uri::redact(&target),
                        category = e.category(),
                        error = %e,
                        "PostgreSQL readiness check failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Wait for PostgreSQL with the default probe and timings.
pub fn wait_until_ready(db_uri: &str) -> DbResult<()> {
    ReadinessProber::new(Arc::new(PostgresProbe::default())).wait_until_ready(db_uri)
}
