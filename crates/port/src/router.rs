use portbridge_core::message::{PortEvent, Ready};
use portbridge_core::{
    Decoded, ErrorCode, PortId, PortMessage, PortSessionId, RpcRequest, RpcResponse,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::rpc::{RpcCorrelator, DISCONNECTED};
use crate::session::{PortSession, SessionState};
use crate::transport::PortSink;

struct PortEntry {
    sink: Arc<dyn PortSink>,
    session: Option<PortSession>,
}

/// What the worker has to act on after the router has done its own
/// bookkeeping for an incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Fully handled (or dropped) by the router.
    Handled,
    Established(PortSession),
    Attached(PortSession),
    Detached(PortSession),
    Event {
        session: PortSession,
        event: PortEvent,
    },
    Request {
        port_id: PortId,
        session: PortSession,
        request: RpcRequest,
    },
}

/// Owner of every live port and its session.
///
/// One router exists per worker lifetime; it starts empty and nothing in it
/// is persisted.
pub struct PortRouter {
    ports: Mutex<HashMap<PortId, PortEntry>>,
    rpc: RpcCorrelator,
}

impl PortRouter {
    pub fn new(rpc: RpcCorrelator) -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            rpc,
        }
    }

    pub fn rpc(&self) -> &RpcCorrelator {
        &self.rpc
    }

    pub async fn open_port(&self, port_id: PortId, sink: Arc<dyn PortSink>) {
        let mut ports = self.ports.lock().await;
        if ports
            .insert(port_id.clone(), PortEntry { sink, session: None })
            .is_some()
        {
            warn!(port_id = %port_id, "Port id reused; previous port state discarded");
        }
        debug!(port_id = %port_id, "Port opened");
    }

    /// Decode and route raw text from a port. Undecodable input is answered
    /// with INVALID_MESSAGE and leaves the session usable.
    pub async fn handle_text(&self, port_id: &PortId, text: &str) -> Routed {
        match PortMessage::decode(text) {
            Ok(Decoded::Known(msg)) => self.handle_message(port_id, msg).await,
            Ok(Decoded::Ignored { discriminator }) => {
                debug!(port_id = %port_id, discriminator = %discriminator, "Ignoring unknown port message");
                Routed::Handled
            }
            Err(e) => {
                warn!(port_id = %port_id, error = %e, "Invalid port message");
                self.post(port_id, &PortMessage::error(ErrorCode::InvalidMessage, e.to_string()))
                    .await;
                Routed::Handled
            }
        }
    }

    pub async fn handle_message(&self, port_id: &PortId, msg: PortMessage) -> Routed {
        let mut ports = self.ports.lock().await;
        let Some(entry) = ports.get_mut(port_id) else {
            warn!(port_id = %port_id, t = msg.discriminator(), "Message for unknown port dropped");
            return Routed::Handled;
        };

        match msg {
            PortMessage::Hello(hello) => {
                if entry.session.is_some() {
                    reply(entry, PortMessage::error(
                        ErrorCode::InvalidMessage,
                        "HELLO received on an established port",
                    ));
                    return Routed::Handled;
                }
                let session = PortSession::establish(&hello);
                reply(entry, PortMessage::Ready(Ready {
                    port_session_id: session.id.clone(),
                    tab_id: session.tab_id,
                    frame_id: session.frame_id,
                }));
                info!(
                    port_id = %port_id,
                    session = %session.id,
                    context = %session.context,
                    instance_id = %session.instance_id,
                    tab_id = ?session.tab_id,
                    "Port session established"
                );
                entry.session = Some(session.clone());
                Routed::Established(session)
            }
            PortMessage::AttachTab(attach) => {
                let result = match entry.session.as_mut() {
                    Some(session) => session
                        .attach(attach.tab_id, attach.frame_id)
                        .map(|_| session.clone())
                        .map_err(|e| e.to_string()),
                    None => Err("no session on this port".to_string()),
                };
                match result {
                    Ok(session) => {
                        debug!(session = %session.id, tab_id = attach.tab_id, "Session attached to tab");
                        Routed::Attached(session)
                    }
                    Err(reason) => {
                        reply(entry, PortMessage::error(ErrorCode::AttachFailed, reason));
                        Routed::Handled
                    }
                }
            }
            PortMessage::DetachTab => {
                let result = match entry.session.as_mut() {
                    Some(session) => session
                        .detach()
                        .map(|_| session.clone())
                        .map_err(|e| e.to_string()),
                    None => Err("no session on this port".to_string()),
                };
                match result {
                    Ok(session) => {
                        debug!(session = %session.id, "Session detached from tab");
                        Routed::Detached(session)
                    }
                    Err(reason) => {
                        reply(entry, PortMessage::error(ErrorCode::AttachFailed, reason));
                        Routed::Handled
                    }
                }
            }
            PortMessage::Event(event) => match session_for(entry, &event.port_session_id) {
                Some(session) => Routed::Event { session, event },
                None => Routed::Handled,
            },
            PortMessage::RpcRequest(request) => {
                match session_for(entry, &request.port_session_id) {
                    Some(session) => Routed::Request {
                        port_id: port_id.clone(),
                        session,
                        request,
                    },
                    None => Routed::Handled,
                }
            }
            PortMessage::RpcResponse(response) | PortMessage::ContentScriptRpcResponse(response) => {
                if session_for(entry, &response.port_session_id).is_none() {
                    return Routed::Handled;
                }
                drop(ports);
                self.rpc.complete(response).await;
                Routed::Handled
            }
            PortMessage::Ready(_) | PortMessage::Error(_) => {
                debug!(port_id = %port_id, t = msg.discriminator(), "Worker-bound copy of an outbound message ignored");
                Routed::Handled
            }
        }
    }

    /// Transport went away: the session is closed and forgotten, and every
    /// call still waiting on it fails locally.
    pub async fn disconnect(&self, port_id: &PortId) -> Option<PortSession> {
        let entry = {
            let mut ports = self.ports.lock().await;
            ports.remove(port_id)
        };
        let mut session = entry?.session?;
        session.close();
        let drained = self.rpc.drain(&session.id, DISCONNECTED).await;
        info!(port_id = %port_id, session = %session.id, drained, "Port session closed");
        Some(session)
    }

    /// Fire-and-forget delivery to a session.
    pub async fn send(&self, session_id: &PortSessionId, message: &PortMessage) -> bool {
        let ports = self.ports.lock().await;
        let Some(entry) = find_by_session(&ports, session_id) else {
            debug!(session = %session_id, "Send to unknown session dropped");
            return false;
        };
        match entry.sink.post(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send a request to a session and wait for its response, a timeout, or
    /// the session closing; whichever comes first.
    pub async fn call(
        &self,
        session_id: &PortSessionId,
        method: &str,
        params: Option<Value>,
    ) -> RpcResponse {
        let id = self.rpc.next_request_id();
        let rx = self.rpc.register(session_id, &id).await;
        let _waiter = self.rpc.guard(session_id, &id);

        let request = PortMessage::RpcRequest(RpcRequest {
            port_session_id: session_id.clone(),
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if !self.send(session_id, &request).await {
            return RpcResponse::failure(session_id.clone(), &id, "session not found");
        }
        self.rpc.wait(session_id, &id, rx).await
    }

    /// Answer a request a context sent to the worker. Returns false when the
    /// port or session no longer exists; the response is then dropped.
    pub async fn respond(&self, port_id: &PortId, response: RpcResponse) -> bool {
        let ports = self.ports.lock().await;
        let Some(entry) = ports.get(port_id) else {
            return false;
        };
        let Some(session) = entry.session.as_ref() else {
            return false;
        };
        if session.id != response.port_session_id {
            return false;
        }
        let message = PortMessage::response_for(session.context, response);
        entry.sink.post(&message).is_ok()
    }

    /// The session on `port_id` if it is still the one identified by
    /// `session_id`.
    pub async fn live_session(
        &self,
        port_id: &PortId,
        session_id: &PortSessionId,
    ) -> Option<PortSession> {
        let ports = self.ports.lock().await;
        ports
            .get(port_id)
            .and_then(|e| e.session.as_ref())
            .filter(|s| &s.id == session_id)
            .cloned()
    }

    pub async fn session(&self, session_id: &PortSessionId) -> Option<PortSession> {
        let ports = self.ports.lock().await;
        find_by_session(&ports, session_id).and_then(|e| e.session.clone())
    }

    pub async fn port_state(&self, port_id: &PortId) -> SessionState {
        let ports = self.ports.lock().await;
        match ports.get(port_id) {
            Some(PortEntry { session: Some(s), .. }) => s.state,
            Some(PortEntry { session: None, .. }) => SessionState::Connecting,
            None => SessionState::Closed,
        }
    }

    pub async fn sessions(&self) -> Vec<PortSession> {
        let ports = self.ports.lock().await;
        ports.values().filter_map(|e| e.session.clone()).collect()
    }

    pub async fn app_sessions(&self) -> Vec<PortSession> {
        self.sessions()
            .await
            .into_iter()
            .filter(|s| s.is_app())
            .collect()
    }

    async fn post(&self, port_id: &PortId, message: &PortMessage) {
        let ports = self.ports.lock().await;
        if let Some(entry) = ports.get(port_id) {
            reply(entry, message.clone());
        }
    }
}

fn reply(entry: &PortEntry, message: PortMessage) {
    if let Err(e) = entry.sink.post(&message) {
        debug!(error = %e, t = message.discriminator(), "Reply dropped, port already gone");
    }
}

/// Check that a message names the session actually bound to its port.
fn session_for(entry: &PortEntry, claimed: &PortSessionId) -> Option<PortSession> {
    match entry.session.as_ref() {
        Some(session) if &session.id == claimed => Some(session.clone()),
        _ => {
            reply(entry, PortMessage::error(
                ErrorCode::SessionNotFound,
                format!("unknown port session {}", claimed),
            ));
            None
        }
    }
}

fn find_by_session<'a>(
    ports: &'a HashMap<PortId, PortEntry>,
    session_id: &PortSessionId,
) -> Option<&'a PortEntry> {
    ports
        .values()
        .find(|e| e.session.as_ref().is_some_and(|s| &s.id == session_id))
}
