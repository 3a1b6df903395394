//! Admission-state store abstractions and backends.
//!
//! The pipeline only needs one primitive: insert a marker if absent with an
//! expiry. Backends are picked once at startup and handed around as
//! `Arc<dyn KvStore>`; business logic never branches on the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

mod sqlite;

pub use sqlite::SqliteKvStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, KvStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Async store contract used by the admission filters.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Inserts a marker for `key` that expires after `ttl`.
    ///
    /// Returns `true` when the marker was created and `false` when a live
    /// marker already exists. A live marker's expiry is never extended.
    async fn try_insert(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Evicts expired markers and returns how many were removed.
    async fn sweep_expired(&self) -> StoreResult<usize>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// In-process store guarded by a single mutex.
///
/// Expired markers are treated as absent on insert; memory is reclaimed by
/// [`KvStore::sweep_expired`], usually driven by [`spawn_kv_sweeper`].
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    markers: Mutex<HashMap<String, Instant>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of markers currently held, expired or not.
    pub fn len(&self) -> usize {
        self.markers.lock().map(|markers| markers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn try_insert(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut markers = self
            .markers
            .lock()
            .map_err(|_| KvStoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        if let Some(expires_at) = markers.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        markers.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn sweep_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let mut markers = self
            .markers
            .lock()
            .map_err(|_| KvStoreError::Unavailable("in-memory store lock poisoned".to_string()))?;
        let before = markers.len();
        markers.retain(|_, expires_at| *expires_at > now);
        Ok(before - markers.len())
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.markers.is_poisoned() {
            return Err(KvStoreError::Unavailable(
                "in-memory store lock poisoned".to_string(),
            ));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Spawns a background task that calls [`KvStore::sweep_expired`] every
/// `interval`. Sweep failures are logged and the loop keeps running.
pub fn spawn_kv_sweeper(store: Arc<dyn KvStore>, interval: Duration) -> JoinHandle<()> {
    let period = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.sweep_expired().await {
                Ok(0) => {}
                Ok(evicted) => tracing::debug!(
                    backend = store.backend_name(),
                    evicted,
                    "kv store sweep evicted expired markers"
                ),
                Err(error) => tracing::warn!(
                    backend = store.backend_name(),
                    %error,
                    "kv store sweep failed"
                ),
            }
        }
    })
}
