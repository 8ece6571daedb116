//! Wire envelopes exchanged between the worker and the other contexts.
//!
//! Port traffic is discriminated by `t`. Runtime (non-port) traffic comes in
//! two families discriminated by `type`: messages sent *to* the worker carry
//! their body in `payload`, messages sent *from* the worker carry it in
//! `data`. Other contexts depend on that asymmetry, so it must not be unified.
//!
//! Decoding never rejects an unknown discriminator. Co-installed contexts can
//! run different versions, so anything we don't recognise comes back as
//! [`Decoded::Ignored`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::pending::PendingBwAppRequest;
use crate::types::{FrameId, PortContext, PortSessionId, TabId};

/// Result of decoding a message whose discriminator may be unknown.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Known(T),
    Ignored { discriminator: String },
}

impl<T> Decoded<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Decoded::Known(v) => Some(v),
            Decoded::Ignored { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Port messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub context: PortContext,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub port_session_id: PortSessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachTab {
    pub tab_id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortEvent {
    pub port_session_id: PortSessionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub port_session_id: PortSessionId,
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response half of the only correlated pair. `error` is a plain string on
/// purpose: it crosses an execution-context boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub port_session_id: PortSessionId,
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(port_session_id: PortSessionId, id: &str, result: Option<Value>) -> Self {
        Self {
            port_session_id,
            id: id.to_string(),
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(port_session_id: PortSessionId, id: &str, error: impl Into<String>) -> Self {
        Self {
            port_session_id,
            id: id.to_string(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> std::result::Result<Option<Value>, String> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AttachFailed,
    InvalidMessage,
    SessionNotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum PortMessage {
    #[serde(rename = "HELLO")]
    Hello(Hello),
    #[serde(rename = "READY")]
    Ready(Ready),
    #[serde(rename = "ATTACH_TAB")]
    AttachTab(AttachTab),
    #[serde(rename = "DETACH_TAB")]
    DetachTab,
    #[serde(rename = "EVENT")]
    Event(PortEvent),
    #[serde(rename = "RPC_REQ")]
    RpcRequest(RpcRequest),
    #[serde(rename = "RPC_RES")]
    RpcResponse(RpcResponse),
    /// Same shape as `RPC_RES`; used when answering a content script.
    #[serde(rename = "BW_CS_RPC_RES")]
    ContentScriptRpcResponse(RpcResponse),
    #[serde(rename = "ERROR")]
    Error(ErrorMessage),
}

impl PortMessage {
    const DISCRIMINATORS: &'static [&'static str] = &[
        "HELLO",
        "READY",
        "ATTACH_TAB",
        "DETACH_TAB",
        "EVENT",
        "RPC_REQ",
        "RPC_RES",
        "BW_CS_RPC_RES",
        "ERROR",
    ];

    pub fn decode(text: &str) -> Result<Decoded<Self>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("message is not JSON: {}", e)))?;
        Self::decode_value(value)
    }

    pub fn decode_value(value: Value) -> Result<Decoded<Self>> {
        let t = value
            .get("t")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("missing discriminator `t`".to_string()))?
            .to_string();

        if !Self::DISCRIMINATORS.contains(&t.as_str()) {
            return Ok(Decoded::Ignored { discriminator: t });
        }

        serde_json::from_value(value)
            .map(Decoded::Known)
            .map_err(|e| Error::Protocol(format!("malformed {} message: {}", t, e)))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn discriminator(&self) -> &'static str {
        match self {
            PortMessage::Hello(_) => "HELLO",
            PortMessage::Ready(_) => "READY",
            PortMessage::AttachTab(_) => "ATTACH_TAB",
            PortMessage::DetachTab => "DETACH_TAB",
            PortMessage::Event(_) => "EVENT",
            PortMessage::RpcRequest(_) => "RPC_REQ",
            PortMessage::RpcResponse(_) => "RPC_RES",
            PortMessage::ContentScriptRpcResponse(_) => "BW_CS_RPC_RES",
            PortMessage::Error(_) => "ERROR",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        PortMessage::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }

    /// Wrap a response with the discriminator the receiving context expects.
    pub fn response_for(context: PortContext, response: RpcResponse) -> Self {
        match context {
            PortContext::ContentScript => PortMessage::ContentScriptRpcResponse(response),
            PortContext::ExtensionApp => PortMessage::RpcResponse(response),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime families (untyped)
// ---------------------------------------------------------------------------

/// Inbound runtime message with its payload left undecoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Outbound runtime message with its data left undecoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Runtime families (typed)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PortContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockSession {
    /// Opaque passcode-derived material; only ever written to the session area.
    pub passcode_material: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemIdle {
    pub state: IdleState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListPending {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDecision {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearPending {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundMessage {
    #[serde(rename = "CLIENT_SW_HELLO")]
    ClientSwHello(ClientHello),
    #[serde(rename = "ACTIVITY_PING")]
    ActivityPing,
    #[serde(rename = "UNLOCK_SESSION")]
    UnlockSession(UnlockSession),
    #[serde(rename = "LOCK_SESSION")]
    LockSession,
    #[serde(rename = "SYSTEM_IDLE_STATE")]
    SystemIdleState(SystemIdle),
    #[serde(rename = "GET_SESSION_STATE")]
    GetSessionState,
    #[serde(rename = "LIST_PENDING_REQUESTS")]
    ListPendingRequests(ListPending),
    #[serde(rename = "RESPOND_PENDING_REQUEST")]
    RespondPendingRequest(PendingDecision),
    #[serde(rename = "CLEAR_PENDING_REQUESTS")]
    ClearPendingRequests(ClearPending),
}

fn shape<T: serde::de::DeserializeOwned>(kind: &str, payload: Option<Value>) -> Result<T> {
    let value = payload.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("malformed {} payload: {}", kind, e)))
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Decoded<Self>> {
        let raw: RawInbound = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed runtime message: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Second decoding pass: look the discriminator up and decode the payload
    /// into its concrete shape.
    pub fn from_raw(raw: RawInbound) -> Result<Decoded<Self>> {
        let RawInbound { kind, payload } = raw;
        let msg = match kind.as_str() {
            "CLIENT_SW_HELLO" => InboundMessage::ClientSwHello(shape(&kind, payload)?),
            "ACTIVITY_PING" => InboundMessage::ActivityPing,
            "UNLOCK_SESSION" => InboundMessage::UnlockSession(shape(&kind, payload)?),
            "LOCK_SESSION" => InboundMessage::LockSession,
            "SYSTEM_IDLE_STATE" => InboundMessage::SystemIdleState(shape(&kind, payload)?),
            "GET_SESSION_STATE" => InboundMessage::GetSessionState,
            "LIST_PENDING_REQUESTS" => InboundMessage::ListPendingRequests(shape(&kind, payload)?),
            "RESPOND_PENDING_REQUEST" => {
                InboundMessage::RespondPendingRequest(shape(&kind, payload)?)
            }
            "CLEAR_PENDING_REQUESTS" => {
                InboundMessage::ClearPendingRequests(shape(&kind, payload)?)
            }
            _ => return Ok(Decoded::Ignored { discriminator: kind }),
        };
        Ok(Decoded::Known(msg))
    }

    pub fn to_raw(&self) -> Result<RawInbound> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHello {
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
    pub session_unlocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWake {
    pub request_id: String,
    pub request_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateData {
    pub unlocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_utc: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLocked {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequestsData {
    pub requests: Vec<PendingBwAppRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequestsChanged {
    pub request_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequestResolved {
    pub request_id: String,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum OutboundMessage {
    #[serde(rename = "SW_CLIENT_HELLO")]
    SwClientHello(WorkerHello),
    #[serde(rename = "SW_APP_WAKE")]
    SwAppWake(AppWake),
    #[serde(rename = "SESSION_STATE")]
    SessionState(SessionStateData),
    #[serde(rename = "SESSION_LOCKED")]
    SessionLocked(SessionLocked),
    #[serde(rename = "PENDING_REQUESTS")]
    PendingRequests(PendingRequestsData),
    #[serde(rename = "PENDING_REQUESTS_CHANGED")]
    PendingRequestsChanged(PendingRequestsChanged),
    #[serde(rename = "PENDING_REQUEST_RESOLVED")]
    PendingRequestResolved(PendingRequestResolved),
}

impl OutboundMessage {
    pub fn decode(text: &str) -> Result<Decoded<Self>> {
        let raw: RawOutbound = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed runtime message: {}", e)))?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawOutbound) -> Result<Decoded<Self>> {
        let RawOutbound { kind, data } = raw;
        let msg = match kind.as_str() {
            "SW_CLIENT_HELLO" => OutboundMessage::SwClientHello(shape(&kind, data)?),
            "SW_APP_WAKE" => OutboundMessage::SwAppWake(shape(&kind, data)?),
            "SESSION_STATE" => OutboundMessage::SessionState(shape(&kind, data)?),
            "SESSION_LOCKED" => OutboundMessage::SessionLocked(shape(&kind, data)?),
            "PENDING_REQUESTS" => OutboundMessage::PendingRequests(shape(&kind, data)?),
            "PENDING_REQUESTS_CHANGED" => {
                OutboundMessage::PendingRequestsChanged(shape(&kind, data)?)
            }
            "PENDING_REQUEST_RESOLVED" => {
                OutboundMessage::PendingRequestResolved(shape(&kind, data)?)
            }
            _ => return Ok(Decoded::Ignored { discriminator: kind }),
        };
        Ok(Decoded::Known(msg))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
