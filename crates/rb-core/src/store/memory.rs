use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Store, StoreError};

#[derive(Default)]
struct Inner {
    values: Map<String, Value>,
    fail_loads: bool,
    fail_saves: bool,
    saves: usize,
}

/// Store kept in memory. Lost on restart unless the same instance is reused.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `values`.
    pub fn with_values(values: Map<String, Value>) -> Self {
        let store = Self::default();
        store.lock().values = values;
        store
    }

    /// Make every subsequent load fail.
    pub fn fail_loads(&self, fail: bool) {
        self.lock().fail_loads = fail;
    }

    /// Make every subsequent save fail.
    pub fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait(?Send)]
impl Store for MemoryStore {
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        let inner = self.lock();
        if inner.fail_loads {
            return Err(StoreError::Unavailable("load refused".to_string()));
        }
        Ok(keys
            .iter()
            .filter_map(|key| inner.values.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_saves {
            return Err(StoreError::Unavailable("save refused".to_string()));
        }
        inner.values.extend(entries);
        inner.saves += 1;
        Ok(())
    }
}
