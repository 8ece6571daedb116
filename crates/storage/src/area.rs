use async_trait::async_trait;
use portbridge_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::file::FileArea;
use crate::memory::MemoryArea;

/// The named storage areas the host exposes.
///
/// `Local` and `Sync` hold durable configuration and passkey material.
/// `Session` holds passcode material and the expiry marker and is the only
/// area the session supervisor is allowed to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaName {
    Local,
    Sync,
    Session,
}

impl fmt::Display for AreaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaName::Local => write!(f, "local"),
            AreaName::Sync => write!(f, "sync"),
            AreaName::Session => write!(f, "session"),
        }
    }
}

/// Change notification delivered to `subscribe()` receivers.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub area: AreaName,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[async_trait]
pub trait StorageArea: Send + Sync {
    fn name(&self) -> AreaName;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key in this area (and only this area).
    async fn clear(&self) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// The three areas, bundled so they can be handed around together.
#[derive(Clone)]
pub struct StorageAreas {
    pub local: Arc<dyn StorageArea>,
    pub sync: Arc<dyn StorageArea>,
    pub session: Arc<dyn StorageArea>,
}

impl StorageAreas {
    /// File-backed local/sync areas under `paths`, in-process session area.
    pub fn open(paths: &Paths) -> Self {
        Self {
            local: Arc::new(FileArea::new(AreaName::Local, paths.area_file("local"))),
            sync: Arc::new(FileArea::new(AreaName::Sync, paths.area_file("sync"))),
            session: Arc::new(MemoryArea::new(AreaName::Session)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            local: Arc::new(MemoryArea::new(AreaName::Local)),
            sync: Arc::new(MemoryArea::new(AreaName::Sync)),
            session: Arc::new(MemoryArea::new(AreaName::Session)),
        }
    }

    pub fn area(&self, name: AreaName) -> &Arc<dyn StorageArea> {
        match name {
            AreaName::Local => &self.local,
            AreaName::Sync => &self.sync,
            AreaName::Session => &self.session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_clearing_one_area_leaves_the_others() {
        let areas = StorageAreas::in_memory();
        areas.local.set("passkey", json!("pk")).await.unwrap();
        areas.sync.set("settings", json!({"theme": "dark"})).await.unwrap();
        areas.session.set("passcode", json!("secret")).await.unwrap();

        areas.area(AreaName::Session).clear().await.unwrap();

        assert_eq!(areas.session.get("passcode").await.unwrap(), None);
        assert_eq!(areas.local.get("passkey").await.unwrap(), Some(json!("pk")));
        assert_eq!(
            areas.sync.get("settings").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );
    }

    #[test]
    fn test_area_names() {
        assert_eq!(AreaName::Session.to_string(), "session");
        assert_eq!(serde_json::to_string(&AreaName::Local).unwrap(), "\"local\"");
    }
}
