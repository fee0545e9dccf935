//! Durable key-value storage collaborator.
//!
//! The store offers independent async `get`/`set`/`remove` calls with
//! last-write-wins semantics and no transactions. Anything that needs a
//! read-modify-write must serialize it itself (see [`crate::settle`]).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable")]
    Unavailable,
    /// A stored value could not be encoded or decoded.
    #[error("invalid stored value for {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// The backing implementation failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Async key-value store holding JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Writes `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Removes `key`. Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store.
///
/// Besides being the default for tests, it can simulate the hazards of a
/// real extension store: a suspension point between a read and the following
/// write (`with_latency`), outages (`set_available`) and calls that never
/// return (`set_stalled`).
#[derive(Debug)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
    latency: Option<Duration>,
    available: AtomicBool,
    stalled: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            latency: None,
            available: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
        }
    }

    /// Delays every operation by `latency` before it touches the map.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every subsequent operation fail with [`StoreError::Unavailable`]
    /// until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes every subsequent operation hang forever. Operations already
    /// past their entry point are unaffected.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn enter(&self) -> Result<(), StoreError> {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.enter().await?;
        Ok(self.values().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.enter().await?;
        self.values().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.values().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_get_absent_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = MemoryStore::new();
        store.set("k", json!(true)).await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable)));
        assert!(matches!(
            store.set("k", json!(1)).await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(store.remove("k").await, Err(StoreError::Unavailable)));

        store.set_available(true);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_store_never_answers() {
        let store = MemoryStore::new();
        store.set_stalled(true);

        let stalled = tokio::time::timeout(Duration::from_millis(50), store.get("k")).await;
        assert!(stalled.is_err());

        store.set_stalled(false);
        assert!(store.get("k").await.is_ok());
    }
}
