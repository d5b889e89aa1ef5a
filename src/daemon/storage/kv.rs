use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Result;
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use serde_json::Value;
use tokio::{fs::File, sync::Mutex};
use tracing::{debug, warn};

use crate::fs::operations::{
    file_name_to_key, key_to_file_name, read_optional, remove_optional, write_atomic,
};

/// Interface for abstracting durable, opaque key-value storage. Values are JSON documents, the
/// same shape a browser storage area holds.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Bytes occupied by `keys`. `None` means the backend has no byte accounting and callers
    /// should estimate.
    async fn bytes_in_use(&self, _keys: &[String]) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Store kept entirely in memory. Used in tests and for ephemeral sessions.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

const LOCK_FILE_NAME: &str = ".lock";
const VALUE_EXTENSION: &str = ".json";

/// The main on-disk realization of [KeyValueStore].
///  - Every key lives in its own JSON file inside one directory.
///  - Writes go through a temp file and a rename.
///  - An advisory lock on `.lock` keeps the daemon and the cli from interleaving writes.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}{VALUE_EXTENSION}", key_to_file_name(key)))
    }

    async fn lock_file(&self) -> Result<File> {
        let file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.dir.join(LOCK_FILE_NAME))
            .await?;
        Ok(file)
    }

    async fn read_value(path: &Path) -> Result<Option<Value>> {
        let Some(bytes) = read_optional(path).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                // A value that isn't JSON can't have been written by us. Treat it as absent so
                // the owner overwrites it.
                warn!("Found illegal json in {path:?}: {e}");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let lock = self.lock_file().await?;
        lock.lock_shared()?;
        let result = Self::read_value(&self.path_for(key)).await;
        lock.unlock_async().await?;
        result
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        let lock = self.lock_file().await?;
        lock.lock_exclusive()?;
        let result = write_atomic(&self.path_for(key), &bytes).await;
        lock.unlock_async().await?;
        debug!("Stored {key} ({} bytes)", bytes.len());
        result
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let lock = self.lock_file().await?;
        lock.lock_exclusive()?;
        let result = remove_optional(&self.path_for(key)).await;
        lock.unlock_async().await?;
        result
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(VALUE_EXTENSION) else {
                continue;
            };
            if let Some(key) = file_name_to_key(stem) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn bytes_in_use(&self, keys: &[String]) -> Result<Option<u64>> {
        let mut total = 0;
        for key in keys {
            match tokio::fs::metadata(self.path_for(key)).await {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};

    async fn exercise(store: &dyn KeyValueStore) -> Result<()> {
        assert_eq!(store.get("usage:2024-01-01").await?, None);

        store.set("usage:2024-01-01", json!({"a": 1})).await?;
        store.set("settings:exclusions", json!(["example.com"])).await?;

        assert_eq!(store.get("usage:2024-01-01").await?, Some(json!({"a": 1})));
        assert_eq!(
            store.keys().await?,
            vec!["settings:exclusions".to_string(), "usage:2024-01-01".to_string()]
        );

        store.remove("usage:2024-01-01").await?;
        store.remove("usage:2024-01-01").await?;
        assert_eq!(store.keys().await?, vec!["settings:exclusions".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store() -> Result<()> {
        let store = MemoryKeyValueStore::new();
        exercise(&store).await?;
        assert_eq!(store.bytes_in_use(&["settings:exclusions".into()]).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store() -> Result<()> {
        let dir = tempdir()?;
        let store = FileKeyValueStore::new(dir.path().join("store"))?;
        exercise(&store).await?;

        let bytes = store
            .bytes_in_use(&["settings:exclusions".into(), "missing".into()])
            .await?;
        assert_eq!(bytes, Some(r#"["example.com"]"#.len() as u64));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        {
            let store = FileKeyValueStore::new(dir.path().to_path_buf())?;
            store.set("data_version", json!(2)).await?;
        }
        let store = FileKeyValueStore::new(dir.path().to_path_buf())?;
        assert_eq!(store.get("data_version").await?, Some(json!(2)));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupted_values() -> Result<()> {
        let dir = tempdir()?;
        let store = FileKeyValueStore::new(dir.path().to_path_buf())?;
        std::fs::write(dir.path().join("broken.json"), b"{not json")?;
        assert_eq!(store.get("broken").await?, None);
        Ok(())
    }
}
