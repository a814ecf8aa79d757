//! Tokio runtime shared by the async clients.
//!
//! The public API is blocking. PostgreSQL and SSH clients run on a small
//! multi-thread runtime that is created on first use and shared by every
//! service of one bootstrap.

use crate::error::{DbBootError, DbResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Lazily created runtime handle. Clones share the same runtime.
#[derive(Debug, Clone, Default)]
pub struct SharedRuntime {
    slot: Arc<Mutex<Option<Arc<Runtime>>>>,
}

impl SharedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing runtime.
    pub fn from_runtime(runtime: Arc<Runtime>) -> Self {
        Self { slot: Arc::new(Mutex::new(Some(runtime))) }
    }

    /// Get the runtime, creating it on first use.
    pub fn get(&self) -> DbResult<Arc<Runtime>> {
        let mut slot = self.slot.lock();
        if let Some(runtime) = slot.as_ref() {
            return Ok(Arc::clone(runtime));
        }

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("dbboot-io")
                .enable_all()
                .build()
                .map_err(|e| DbBootError::internal(format!("Failed to create tokio runtime: {e}")))?,
        );
        tracing::debug!("Created tokio runtime");
        *slot = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    /// Check if the runtime has been created.
    pub fn is_started(&self) -> bool {
        self.slot.lock().is_some()
    }
}
