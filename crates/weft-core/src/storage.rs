//! The opaque key-value storage contract
//!
//! The application provides the store; Weft composes all keys itself and
//! writes through immediately. `store`/`delete` must be durable before
//! returning.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Application-provided key-value storage.
///
/// Keys are UTF-8 strings composed entirely by Weft (versioned under a
/// `weft/v1/` prefix); values are opaque bytes. Implementations must not
/// defer or batch writes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Load the value stored under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, durably, before returning
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete the value stored under `key` (no-op if absent)
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Typed JSON views over a [`KeyValueStore`]
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Load and deserialize a JSON value
    async fn load_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.load(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Serialization(format!("{key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serialize a value to JSON and store it
    async fn store_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::Serialization(format!("{key}: {e}")))?;
        self.store(key, bytes).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// In-memory storage for tests
pub struct MemoryStore {
    values: parking_lot::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            values: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Snapshot of all stored keys
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
