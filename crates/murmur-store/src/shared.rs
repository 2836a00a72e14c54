//! Async access to a [`Database`] shared across request handlers.
//!
//! `rusqlite::Connection` is blocking and not `Sync`, so the connection sits
//! behind a `std::sync::Mutex` and every call runs on the tokio blocking
//! pool. The lock is held only for the duration of one closure, never across
//! an await point, and is unrelated to any realtime gateway state.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::database::Database;
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Database::open_at(path).map(Self::new)
    }

    pub fn open_in_memory() -> Result<Self> {
        Database::open_in_memory().map(Self::new)
    }

    /// Run `f` against the database on the blocking pool.
    ///
    /// Each call is atomic with respect to other calls: the closure has the
    /// connection to itself until it returns.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            // A panicking closure drops its open transaction, which rolls
            // back, so the connection behind a poisoned lock is still sound.
            let db = inner.lock().unwrap_or_else(|poisoned| {
                warn!("Recovering database handle after a panicked call");
                poisoned.into_inner()
            });
            f(&db)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
