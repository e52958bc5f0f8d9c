use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use rb_core::store::{Store, StoreError};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::Mutex;

/// Store persisted as a single JSON object in a file.
///
/// Saves rewrite the whole object through a temporary file so a crash never
/// leaves a truncated state file behind.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Corrupt(format!(
                "expected a JSON object in '{}', found {}",
                self.path.display(),
                other
            ))),
        }
    }
}

#[async_trait(?Send)]
impl Store for JsonFileStore {
    async fn load(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        let mut all = self.read_all().await?;
        Ok(keys
            .iter()
            .filter_map(|key| all.remove(*key).map(|value| (key.to_string(), value)))
            .collect())
    }

    async fn save(&self, entries: Map<String, Value>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.read_all().await?;
        all.extend(entries);
        let bytes = serde_json::to_vec_pretty(&Value::Object(all))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Saved state to '{}'", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rb_core::store::{entry, KEY_ENABLED, KEY_PATTERN};

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load(&[KEY_PATTERN]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saves_merge_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::new(&path);
        store.save(entry(KEY_PATTERN, "ads")).await.unwrap();
        store.save(entry(KEY_ENABLED, true)).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        let loaded = reopened.load(&[KEY_PATTERN, KEY_ENABLED]).await.unwrap();
        assert_eq!(loaded.get(KEY_PATTERN), Some(&Value::from("ads")));
        assert_eq!(loaded.get(KEY_ENABLED), Some(&Value::from(true)));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(&[KEY_PATTERN]).await, Err(StoreError::Corrupt(_))));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(store.load(&[KEY_PATTERN]).await, Err(StoreError::Serialization(_))));
    }
}
