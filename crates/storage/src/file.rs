use async_trait::async_trait;
use portbridge_core::{Error, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::area::{AreaName, StorageArea, StorageChange};

/// Durable area persisted as a single JSON object file.
///
/// Every write rewrites the whole object through a temp file and a rename,
/// so readers see either the old or the new content, never a torn file.
/// A file that exists but does not parse is a storage error; it is never
/// silently replaced.
pub struct FileArea {
    name: AreaName,
    path: PathBuf,
    io_lock: Mutex<()>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileArea {
    pub fn new(name: AreaName, path: PathBuf) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            name,
            path,
            io_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Map::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::Storage(format!(
                "{} area file is not a JSON object: {}",
                self.name,
                self.path.display()
            ))),
            Err(e) => Err(Error::Storage(format!(
                "{} area file is corrupt ({}): {}",
                self.name,
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_all(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(map)?;
        let tmp_path = self
            .path
            .with_extension(format!("tmp_{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Storage(format!("Atomic rename failed: {}", e)));
        }
        debug!(area = %self.name, keys = map.len(), "Area persisted");
        Ok(())
    }

    fn notify(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        let _ = self.changes.send(StorageChange {
            area: self.name,
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

#[async_trait]
impl StorageArea for FileArea {
    fn name(&self) -> AreaName {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.io_lock.lock().await;
        let map = self.read_all().await?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let old = {
            let _guard = self.io_lock.lock().await;
            let mut map = self.read_all().await?;
            let old = map.insert(key.to_string(), value.clone());
            self.write_all(&map).await?;
            old
        };
        self.notify(key, old, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let old = {
            let _guard = self.io_lock.lock().await;
            let mut map = self.read_all().await?;
            let old = map.remove(key);
            if old.is_some() {
                self.write_all(&map).await?;
            }
            old
        };
        if old.is_some() {
            self.notify(key, old, None);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let drained = {
            let _guard = self.io_lock.lock().await;
            let map = self.read_all().await?;
            self.write_all(&Map::new()).await?;
            map
        };
        for (key, old) in drained {
            self.notify(&key, Some(old), None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
