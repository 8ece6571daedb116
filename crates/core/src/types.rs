use serde::{Deserialize, Serialize};
use std::fmt;

/// Browser tab identifier as handed out by the host.
pub type TabId = i64;

/// Frame identifier within a tab (0 is the top frame).
pub type FrameId = i64;

/// Worker-allocated identity of one live port session.
///
/// Allocated on HELLO and never reused: a reconnecting context always
/// receives a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortSessionId(pub String);

impl PortSessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortSessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-level port name, assigned by whoever accepted the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub String);

impl PortId {
    pub fn generate() -> Self {
        Self(format!("port_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which kind of context opened the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortContext {
    #[serde(rename = "content-script")]
    ContentScript,
    #[serde(rename = "extension-app")]
    ExtensionApp,
}

impl fmt::Display for PortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortContext::ContentScript => write!(f, "content-script"),
            PortContext::ExtensionApp => write!(f, "extension-app"),
        }
    }
}
