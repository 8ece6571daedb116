use async_trait::async_trait;
use portbridge_core::Result;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};

use crate::area::{AreaName, StorageArea, StorageChange};

/// In-process area. Its content lives exactly as long as the process, which
/// is what the host's session area promises.
pub struct MemoryArea {
    name: AreaName,
    values: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryArea {
    pub fn new(name: AreaName) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            name,
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        // no receivers is fine
        let _ = self.changes.send(StorageChange {
            area: self.name,
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

#[async_trait]
impl StorageArea for MemoryArea {
    fn name(&self) -> AreaName {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.lock().await;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let old = {
            let mut values = self.values.lock().await;
            values.insert(key.to_string(), value.clone())
        };
        self.notify(key, old, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let old = {
            let mut values = self.values.lock().await;
            values.remove(key)
        };
        if old.is_some() {
            self.notify(key, old, None);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let drained: Vec<(String, Value)> = {
            let mut values = self.values.lock().await;
            values.drain().collect()
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
