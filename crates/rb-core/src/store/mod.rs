//! Durable key/value persistence
//!
//! The controller keeps three keys. Writes are independent of each other;
//! the controller orders them so a reader never sees a half-applied command.

mod memory;

use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use memory::MemoryStore;

/// Stored pattern (string).
pub const KEY_PATTERN: &str = "regex";

/// Stored enabled flag (bool).
pub const KEY_ENABLED: &str = "ruleEnabled";

/// Stored blocked request counter (integer).
pub const KEY_BLOCKED_COUNT: &str = "blockedCount";

/// Error type for persistence calls.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage contents are corrupt: {0}")]
    Corrupt(String),
}

/// Durable key/value store.
#[async_trait(?Send)]
pub trait Store {
    /// Load the given keys. Keys that were never saved are absent from the map.
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError>;

    /// Save the given entries, leaving other keys untouched.
    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError>;
}

#[async_trait(?Send)]
impl<T: Store + ?Sized> Store for Arc<T> {
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        (**self).load(keys).await
    }

    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        (**self).save(entries).await
    }
}

#[async_trait(?Send)]
impl<T: Store + ?Sized> Store for Rc<T> {
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        (**self).load(keys).await
    }

    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        (**self).save(entries).await
    }
}

/// Build a single-entry map for [`Store::save`].
pub fn entry(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value.into());
    map
}
