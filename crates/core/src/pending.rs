use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{PortId, PortSessionId, TabId};

/// Where the answer to a pending request should be delivered, if anywhere.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingHints {
    pub tab_id: Option<TabId>,
    pub tab_url: Option<String>,
    pub port_id: Option<PortId>,
    pub port_session_id: Option<PortSessionId>,
    pub rpc_request_id: Option<String>,
}

/// A request parked by the worker until a human decides on it in a UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBwAppRequest {
    pub request_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<PortId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_session_id: Option<PortSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_request_id: Option<String>,
}

/// Typed view of a pending request payload, keyed by the entry's `type`.
pub trait PendingPayload: DeserializeOwned {
    const TYPE: &'static str;
}

/// Outcome of reading a persisted payload back into a concrete shape.
///
/// The stored type tag and payload bytes may come from different versions,
/// so every failure mode is a value rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadRead<T> {
    Decoded(T),
    /// Nothing stored.
    Absent,
    /// Entry carries a different type tag.
    Mismatch { found: String },
    /// Tag matched but the bytes did not fit the shape.
    Invalid(String),
}

impl PendingBwAppRequest {
    pub fn new(kind: &str, payload: Value, hints: RoutingHints) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload,
            created_at_utc: Utc::now(),
            tab_id: hints.tab_id,
            tab_url: hints.tab_url,
            port_id: hints.port_id,
            port_session_id: hints.port_session_id,
            rpc_request_id: hints.rpc_request_id,
        }
    }

    pub fn payload_as<T: PendingPayload>(&self) -> PayloadRead<T> {
        if self.kind != T::TYPE {
            return PayloadRead::Mismatch {
                found: self.kind.clone(),
            };
        }
        if self.payload.is_null() {
            return PayloadRead::Absent;
        }
        match serde_json::from_value::<T>(self.payload.clone()) {
            Ok(v) => PayloadRead::Decoded(v),
            Err(e) => PayloadRead::Invalid(e.to_string()),
        }
    }

    /// True when enough routing survives to attempt delivering an answer.
    pub fn is_routable(&self) -> bool {
        self.port_id.is_some() && self.port_session_id.is_some() && self.rpc_request_id.is_some()
    }
}

/// Oldest-first, copy-on-write collection of pending requests.
///
/// Every transform returns a new collection and leaves `self` untouched, so a
/// snapshot handed to a reader can never change underneath it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingBwAppRequests {
    entries: Vec<PendingBwAppRequest>,
}

impl PendingBwAppRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(entries: Vec<PendingBwAppRequest>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingBwAppRequest> {
        self.entries.iter()
    }

    pub fn get(&self, request_id: &str) -> Option<&PendingBwAppRequest> {
        self.entries.iter().find(|r| r.request_id == request_id)
    }

    pub fn of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a PendingBwAppRequest> {
        self.entries.iter().filter(move |r| r.kind == kind)
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.request_id.clone()).collect()
    }

    pub fn to_vec(&self) -> Vec<PendingBwAppRequest> {
        self.entries.clone()
    }

    pub fn with_added(&self, request: PendingBwAppRequest) -> Self {
        let mut next = self.to_vec();
        next.push(request);
        Self::from_vec(next)
    }

    pub fn without(&self, request_id: &str) -> Self {
        self.retained(|r| r.request_id != request_id)
    }

    pub fn without_older_than(&self, cutoff: DateTime<Utc>) -> Self {
        self.retained(|r| r.created_at_utc >= cutoff)
    }

    pub fn retained(&self, keep: impl Fn(&PendingBwAppRequest) -> bool) -> Self {
        Self::from_vec(self.entries.iter().filter(|r| keep(r)).cloned().collect())
    }
}
