use chrono::{DateTime, Utc};
use portbridge_core::message::{
    AppWake, ListPending, PendingRequestResolved, PendingRequestsChanged, PendingRequestsData,
    WorkerHello,
};
use portbridge_core::{
    Config, Decoded, InboundMessage, OutboundMessage, PortId, PortMessage, Result, RoutingHints,
    RpcResponse,
};
use portbridge_port::{PortRouter, PortSink, Routed, RpcCorrelator};
use portbridge_storage::StorageAreas;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handler::{HandlerOutcome, HandlerRegistry, IncomingCall};
use crate::orphan::{cleanup_all_pending_requests, reconcile_for_app_session};
use crate::request_store::PendingRequestStore;
use crate::supervisor::SessionSupervisor;

/// The background context: owns every port, the pending-request queue and
/// the user session, and answers runtime messages.
pub struct BackgroundWorker {
    config: Config,
    router: Arc<PortRouter>,
    store: Arc<PendingRequestStore>,
    supervisor: Arc<SessionSupervisor>,
    handlers: HandlerRegistry,
    events: broadcast::Sender<OutboundMessage>,
    started_at: DateTime<Utc>,
}

impl BackgroundWorker {
    pub fn new(config: Config, areas: &StorageAreas, handlers: HandlerRegistry) -> Self {
        let mut rpc = RpcCorrelator::new(config.rpc.call_timeout());
        if let Some(prefix) = &config.rpc.id_prefix {
            rpc = rpc.with_id_prefix(prefix);
        }
        let router = Arc::new(PortRouter::new(rpc));
        let store = Arc::new(PendingRequestStore::new(
            Arc::clone(&areas.local),
            &config.pending.storage_key,
        ));
        let (events, _) = broadcast::channel(256);
        let supervisor = Arc::new(SessionSupervisor::new(
            config.session.clone(),
            Arc::clone(&areas.session),
            Arc::clone(&store),
            Arc::clone(&router),
            events.clone(),
        ));
        Self {
            config,
            router,
            store,
            supervisor,
            handlers,
            events,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<PortRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<PendingRequestStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Broadcasts for every runtime client.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.events.subscribe()
    }

    /// Worker start-up: prune stale queue entries and pick up a surviving
    /// session. Neither failure is fatal.
    pub async fn start(&self) -> Result<()> {
        match self.prune_cutoff() {
            Some(cutoff) => match self.store.remove_older_than(cutoff).await {
                Ok(pruned) => {
                    if pruned > 0 {
                        info!(pruned, "Pruned expired pending requests");
                    }
                }
                Err(e) => warn!(error = %e, "Could not prune pending requests"),
            },
            None => warn!(
                max_age_secs = self.config.pending.max_age_secs,
                "Pending max age out of range, skipping prune"
            ),
        }
        if let Err(e) = self.supervisor.restore().await {
            warn!(error = %e, "Could not restore session state");
        }
        info!(started_at = %self.started_at, "Background worker started");
        Ok(())
    }

    /// Entries created before this instant are stale. `None` when the
    /// configured age reaches past the representable range, in which case
    /// nothing is old enough to prune.
    fn prune_cutoff(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.config.pending.max_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
    }

    pub fn spawn_supervisor(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.supervisor).run_loop(shutdown))
    }

    // -----------------------------------------------------------------------
    // Port side
    // -----------------------------------------------------------------------

    pub async fn connect_port(&self, sink: Arc<dyn PortSink>) -> PortId {
        let port_id = PortId::generate();
        self.router.open_port(port_id.clone(), sink).await;
        port_id
    }

    pub async fn on_port_text(&self, port_id: &PortId, text: &str) {
        let routed = self.router.handle_text(port_id, text).await;
        self.react(routed).await;
    }

    pub async fn on_port_message(&self, port_id: &PortId, message: PortMessage) {
        let routed = self.router.handle_message(port_id, message).await;
        self.react(routed).await;
    }

    pub async fn on_port_closed(&self, port_id: &PortId) {
        if let Some(session) = self.router.disconnect(port_id).await {
            debug!(port = %port_id, session = %session.id, "Port session ended");
        }
    }

    async fn react(&self, routed: Routed) {
        match routed {
            Routed::Established(session) | Routed::Attached(session) if session.is_app() => {
                let removed = reconcile_for_app_session(&self.store, &session).await;
                self.announce_changed(removed);
            }
            Routed::Event { session, event } => {
                if event.name == "activity" && session.is_app() {
                    self.supervisor.record_activity().await;
                } else {
                    debug!(session = %session.id, name = %event.name, "Port event");
                }
            }
            Routed::Request {
                port_id,
                session,
                request,
            } => {
                self.dispatch(IncomingCall {
                    port_id,
                    session,
                    request,
                })
                .await;
            }
            _ => {}
        }
    }

    async fn dispatch(&self, call: IncomingCall) {
        let Some(handler) = self.handlers.get(&call.request.method) else {
            warn!(method = %call.request.method, "No handler for method");
            self.reply(
                &call,
                Err(format!("unknown method: {}", call.request.method)),
            )
            .await;
            return;
        };

        match handler.handle(&call).await {
            HandlerOutcome::Respond(result) => self.reply(&call, result).await,
            HandlerOutcome::NeedsApproval {
                kind,
                payload,
                tab_url,
            } => {
                let hints = RoutingHints {
                    tab_id: call.session.bound_tab(),
                    tab_url,
                    port_id: Some(call.port_id.clone()),
                    port_session_id: Some(call.session.id.clone()),
                    rpc_request_id: Some(call.request.id.clone()),
                };
                match self.store.enqueue(&kind, payload, hints).await {
                    Ok(request_id) => {
                        let _ = self.events.send(OutboundMessage::SwAppWake(AppWake {
                            request_id: request_id.clone(),
                            request_type: kind,
                        }));
                        self.announce_changed(vec![request_id]);
                    }
                    Err(e) => {
                        warn!(
                            method = %call.request.method,
                            request_id = %call.request.id,
                            error = %e,
                            "Could not queue request for approval"
                        );
                    }
                }
            }
        }
    }

    async fn reply(&self, call: &IncomingCall, result: std::result::Result<Option<serde_json::Value>, String>) {
        let session_id = call.session.id.clone();
        let response = match result {
            Ok(value) => RpcResponse::success(session_id, &call.request.id, value),
            Err(error) => RpcResponse::failure(session_id, &call.request.id, error),
        };
        if !self.router.respond(&call.port_id, response).await {
            debug!(request_id = %call.request.id, "Caller went away before the reply");
        }
    }

    fn announce_changed(&self, request_ids: Vec<String>) {
        if request_ids.is_empty() {
            return;
        }
        let _ = self
            .events
            .send(OutboundMessage::PendingRequestsChanged(PendingRequestsChanged {
                request_ids,
            }));
    }

    // -----------------------------------------------------------------------
    // Runtime side
    // -----------------------------------------------------------------------

    /// Handle one runtime message. Returns the direct reply, if any.
    pub async fn on_runtime_text(&self, text: &str) -> Option<OutboundMessage> {
        match InboundMessage::decode(text) {
            Ok(Decoded::Known(message)) => self.on_runtime_message(message).await,
            Ok(Decoded::Ignored { discriminator }) => {
                debug!(kind = %discriminator, "Ignoring runtime message");
                None
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed runtime message");
                None
            }
        }
    }

    pub async fn on_runtime_message(&self, message: InboundMessage) -> Option<OutboundMessage> {
        match message {
            InboundMessage::ClientSwHello(hello) => {
                debug!(instance_id = %hello.instance_id, "Runtime client connected");
                Some(OutboundMessage::SwClientHello(WorkerHello {
                    started_at_utc: self.started_at,
                    session_unlocked: self.supervisor.is_unlocked().await,
                }))
            }
            InboundMessage::ActivityPing => {
                self.supervisor.record_activity().await;
                None
            }
            InboundMessage::UnlockSession(unlock) => {
                match self.supervisor.unlock(&unlock.passcode_material).await {
                    Ok(state) => Some(OutboundMessage::SessionState(state)),
                    Err(e) => {
                        warn!(error = %e, "Unlock failed");
                        None
                    }
                }
            }
            InboundMessage::LockSession => {
                self.supervisor.lock("user").await;
                Some(OutboundMessage::SessionState(self.supervisor.state().await))
            }
            InboundMessage::SystemIdleState(idle) => {
                self.supervisor.on_idle_state(idle.state).await;
                None
            }
            InboundMessage::GetSessionState => {
                Some(OutboundMessage::SessionState(self.supervisor.state().await))
            }
            InboundMessage::ListPendingRequests(ListPending { kind }) => {
                match self.store.list(kind.as_deref()).await {
                    Ok(requests) => Some(OutboundMessage::PendingRequests(PendingRequestsData {
                        requests,
                    })),
                    Err(e) => {
                        warn!(error = %e, "Could not list pending requests");
                        None
                    }
                }
            }
            InboundMessage::RespondPendingRequest(decision) => {
                match self.store.resolve(&self.router, decision).await {
                    Ok(resolution) => {
                        if resolution.found {
                            self.announce_changed(vec![resolution.request_id.clone()]);
                        }
                        let resolved = PendingRequestResolved {
                            request_id: resolution.request_id,
                            delivered: resolution.delivered,
                        };
                        let _ = self
                            .events
                            .send(OutboundMessage::PendingRequestResolved(resolved.clone()));
                        Some(OutboundMessage::PendingRequestResolved(resolved))
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not resolve pending request");
                        None
                    }
                }
            }
            InboundMessage::ClearPendingRequests(clear) => {
                let removed = cleanup_all_pending_requests(&self.store, &clear.reason).await;
                self.announce_changed(removed.clone());
                Some(OutboundMessage::PendingRequestsChanged(PendingRequestsChanged {
                    request_ids: removed,
                }))
            }
        }
    }
}
