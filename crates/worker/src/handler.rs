use async_trait::async_trait;
use portbridge_core::{PortId, RpcRequest};
use portbridge_port::PortSession;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One RPC_REQ as delivered to a handler.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub port_id: PortId,
    pub session: PortSession,
    pub request: RpcRequest,
}

impl IncomingCall {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.request.params.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Answer right away.
    Respond(Result<Option<Value>, String>),
    /// Queue for a human decision; the answer goes out when it is resolved.
    NeedsApproval {
        kind: String,
        payload: Value,
        tab_url: Option<String>,
    },
}

#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, call: &IncomingCall) -> HandlerOutcome;
}

/// Method name to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: &str, handler: Arc<dyn RpcHandler>) {
        self.handlers.insert(method.to_string(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// `ping` answered inline, plus `requestApproval` queued as `APPROVAL_REQUEST`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ping", Arc::new(PingHandler));
        registry.register("requestApproval", Arc::new(ApprovalHandler::new("APPROVAL_REQUEST")));
        registry
    }
}

pub struct PingHandler;

#[async_trait]
impl RpcHandler for PingHandler {
    async fn handle(&self, call: &IncomingCall) -> HandlerOutcome {
        HandlerOutcome::Respond(Ok(Some(json!({
            "pong": true,
            "portSessionId": call.session.id,
        }))))
    }
}

/// Queues every call as a pending request of one type. The call params
/// become the payload; a `tabUrl` param is lifted into the routing hints.
pub struct ApprovalHandler {
    kind: String,
}

impl ApprovalHandler {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}

#[async_trait]
impl RpcHandler for ApprovalHandler {
    async fn handle(&self, call: &IncomingCall) -> HandlerOutcome {
        HandlerOutcome::NeedsApproval {
            kind: self.kind.clone(),
            payload: call.request.params.clone().unwrap_or(Value::Null),
            tab_url: call.param_str("tabUrl").map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_core::message::Hello;
    use portbridge_core::{PortContext, PortSessionId};

    fn call(method: &str, params: Option<Value>) -> IncomingCall {
        let session = PortSession::establish(&Hello {
            context: PortContext::ContentScript,
            instance_id: "cs".to_string(),
            tab_id: Some(3),
            frame_id: None,
        });
        IncomingCall {
            port_id: PortId::from("p"),
            request: RpcRequest {
                port_session_id: session.id.clone(),
                id: "q1".to_string(),
                method: method.to_string(),
                params,
            },
            session,
        }
    }

    #[tokio::test]
    async fn test_ping_answers_inline() {
        let c = call("ping", None);
        match PingHandler.handle(&c).await {
            HandlerOutcome::Respond(Ok(Some(v))) => {
                assert_eq!(v["pong"], json!(true));
                assert_eq!(
                    serde_json::from_value::<PortSessionId>(v["portSessionId"].clone()).unwrap(),
                    c.session.id
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_approval_lifts_tab_url() {
        let c = call(
            "requestApproval",
            Some(json!({"tabUrl": "https://example.com", "amount": 3})),
        );
        let outcome = ApprovalHandler::new("APPROVAL_REQUEST").handle(&c).await;
        assert_eq!(
            outcome,
            HandlerOutcome::NeedsApproval {
                kind: "APPROVAL_REQUEST".to_string(),
                payload: json!({"tabUrl": "https://example.com", "amount": 3}),
                tab_url: Some("https://example.com".to_string()),
            }
        );
    }

    #[test]
    fn test_defaults() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(registry.methods(), vec!["ping", "requestApproval"]);
        assert!(registry.get("nope").is_none());
    }
}
