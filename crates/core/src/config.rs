use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    /// Upper bound for any awaited RPC call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Optional prefix for worker-generated request ids (handy when tracing).
    #[serde(default)]
    pub id_prefix: Option<String>,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            id_prefix: None,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Lock as soon as the host reports the system as locked.
    #[serde(default = "default_lock_on_system_idle")]
    pub lock_on_system_idle: bool,
}

fn default_inactivity_timeout_secs() -> u64 {
    15 * 60
}

fn default_check_interval_secs() -> u64 {
    15
}

fn default_lock_on_system_idle() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            lock_on_system_idle: default_lock_on_system_idle(),
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfig {
    /// Entries older than this are pruned when the worker starts.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Key of the queue inside the local storage area.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_storage_key() -> String {
    "pendingBwAppRequests".to_string()
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            storage_key: default_storage_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18790
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.rpc.call_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.session.inactivity_timeout_secs, 900);
        assert!(cfg.session.lock_on_system_idle);
        assert_eq!(cfg.pending.storage_key, "pendingBwAppRequests");
        assert_eq!(cfg.gateway.port, 18790);
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"{
  "rpc": { "callTimeoutMs": 500 },
  "session": { "inactivityTimeoutSecs": 60, "checkIntervalSecs": 0 }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.rpc.call_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.session.inactivity_timeout(), Duration::from_secs(60));
        // zero interval is clamped so the supervisor loop never spins
        assert_eq!(cfg.session.check_interval(), Duration::from_secs(1));
        assert!(cfg.session.lock_on_system_idle);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.gateway.port = 9999;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.gateway.port, 9999);
    }
}
