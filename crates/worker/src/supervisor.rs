use chrono::{DateTime, Utc};
use portbridge_core::config::SessionConfig;
use portbridge_core::message::{
    IdleState, OutboundMessage, PendingRequestsChanged, PortEvent, SessionLocked, SessionStateData,
};
use portbridge_core::{PortMessage, Result};
use portbridge_port::PortRouter;
use portbridge_storage::StorageArea;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::orphan::cleanup_all_pending_requests;
use crate::request_store::PendingRequestStore;

/// Session-area key holding the passcode-derived material.
pub const PASSCODE_KEY: &str = "passcodeMaterial";
/// Session-area key holding the current expiry deadline.
pub const EXPIRY_KEY: &str = "sessionExpiresAtUtc";

#[derive(Debug, Default)]
struct Lease {
    unlocked: bool,
    expires_at: Option<DateTime<Utc>>,
}

/// Tracks whether the user session is unlocked and tears it down on
/// inactivity, system lock or explicit request.
pub struct SessionSupervisor {
    config: SessionConfig,
    session_area: Arc<dyn StorageArea>,
    store: Arc<PendingRequestStore>,
    router: Arc<PortRouter>,
    events: broadcast::Sender<OutboundMessage>,
    lease: Mutex<Lease>,
}

impl SessionSupervisor {
    pub fn new(
        config: SessionConfig,
        session_area: Arc<dyn StorageArea>,
        store: Arc<PendingRequestStore>,
        router: Arc<PortRouter>,
        events: broadcast::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            config,
            session_area,
            store,
            router,
            events,
            lease: Mutex::new(Lease::default()),
        }
    }

    fn next_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.inactivity_timeout())
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn state(&self) -> SessionStateData {
        let lease = self.lease.lock().await;
        SessionStateData {
            unlocked: lease.unlocked,
            expires_at_utc: lease.expires_at,
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.lease.lock().await.unlocked
    }

    /// Pick up an unlocked session that survived a worker restart.
    pub async fn restore(&self) -> Result<()> {
        let passcode = self.session_area.get(PASSCODE_KEY).await?;
        let expiry = self
            .session_area
            .get(EXPIRY_KEY)
            .await?
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok());

        match (passcode, expiry) {
            (Some(_), Some(expires_at)) if expires_at > Utc::now() => {
                let mut lease = self.lease.lock().await;
                lease.unlocked = true;
                lease.expires_at = Some(expires_at);
                info!(expires_at = %expires_at, "Restored unlocked session");
                Ok(())
            }
            (None, None) => Ok(()),
            _ => {
                self.lock("expired").await;
                Ok(())
            }
        }
    }

    pub async fn unlock(&self, passcode_material: &str) -> Result<SessionStateData> {
        let expires_at = self.next_deadline(Utc::now());
        self.session_area
            .set(PASSCODE_KEY, Value::String(passcode_material.to_string()))
            .await?;
        self.session_area
            .set(EXPIRY_KEY, serde_json::to_value(expires_at)?)
            .await?;

        let mut lease = self.lease.lock().await;
        lease.unlocked = true;
        lease.expires_at = Some(expires_at);
        info!(expires_at = %expires_at, "Session unlocked");
        Ok(SessionStateData {
            unlocked: true,
            expires_at_utc: Some(expires_at),
        })
    }

    /// Push the inactivity deadline out. No effect while locked.
    pub async fn record_activity(&self) -> Option<DateTime<Utc>> {
        let expires_at = {
            let mut lease = self.lease.lock().await;
            if !lease.unlocked {
                return None;
            }
            let expires_at = self.next_deadline(Utc::now());
            lease.expires_at = Some(expires_at);
            expires_at
        };
        match serde_json::to_value(expires_at) {
            Ok(v) => {
                if let Err(e) = self.session_area.set(EXPIRY_KEY, v).await {
                    warn!(error = %e, "Could not persist session deadline");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode session deadline"),
        }
        debug!(expires_at = %expires_at, "Activity recorded");
        Some(expires_at)
    }

    /// Lock when the deadline has passed. Returns true if it locked.
    pub async fn check_expiry(&self, now: DateTime<Utc>) -> bool {
        let expired = {
            let lease = self.lease.lock().await;
            lease.unlocked && lease.expires_at.is_some_and(|at| at <= now)
        };
        if expired {
            self.lock("inactivity").await;
        }
        expired
    }

    pub async fn on_idle_state(&self, state: IdleState) -> bool {
        match state {
            IdleState::Locked if self.config.lock_on_system_idle => {
                self.lock("system locked").await;
                true
            }
            IdleState::Active => {
                self.record_activity().await;
                false
            }
            _ => false,
        }
    }

    /// Tear the session down.
    ///
    /// Wipes the session area (never local or sync), discards every pending
    /// request without replying and tells every UI.
    pub async fn lock(&self, reason: &str) {
        {
            let mut lease = self.lease.lock().await;
            lease.unlocked = false;
            lease.expires_at = None;
        }
        if let Err(e) = self.session_area.clear().await {
            error!(error = %e, "Failed to clear session storage");
        }

        let removed = cleanup_all_pending_requests(&self.store, reason).await;
        if !removed.is_empty() {
            let _ = self
                .events
                .send(OutboundMessage::PendingRequestsChanged(PendingRequestsChanged {
                    request_ids: removed,
                }));
        }
        let _ = self.events.send(OutboundMessage::SessionLocked(SessionLocked {
            reason: reason.to_string(),
        }));

        for session in self.router.app_sessions().await {
            let event = PortMessage::Event(PortEvent {
                port_session_id: session.id.clone(),
                name: "sessionLocked".to_string(),
                data: Some(json!({ "reason": reason })),
            });
            self.router.send(&session.id, &event).await;
        }
        info!(reason, "Session locked");
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.check_interval();
        info!(interval_secs = period.as_secs(), "SessionSupervisor started");
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_expiry(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("SessionSupervisor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_core::message::Hello;
    use portbridge_core::{PortContext, PortId, RoutingHints};
    use portbridge_port::{ChannelSink, RpcCorrelator};
    use portbridge_storage::{AreaName, MemoryArea};
    use std::time::Duration;

    struct Harness {
        supervisor: SessionSupervisor,
        session_area: Arc<MemoryArea>,
        local_area: Arc<MemoryArea>,
        store: Arc<PendingRequestStore>,
        router: Arc<PortRouter>,
        events: broadcast::Receiver<OutboundMessage>,
    }

    fn harness(inactivity_timeout_secs: u64) -> Harness {
        let session_area = Arc::new(MemoryArea::new(AreaName::Session));
        let local_area = Arc::new(MemoryArea::new(AreaName::Local));
        let store = Arc::new(PendingRequestStore::new(local_area.clone(), "pending"));
        let router = Arc::new(PortRouter::new(RpcCorrelator::new(Duration::from_secs(1))));
        let (tx, events) = broadcast::channel(16);
        let config = SessionConfig {
            inactivity_timeout_secs,
            ..Default::default()
        };
        Harness {
            supervisor: SessionSupervisor::new(
                config,
                session_area.clone(),
                store.clone(),
                router.clone(),
                tx,
            ),
            session_area,
            local_area,
            store,
            router,
            events,
        }
    }

    #[tokio::test]
    async fn test_unlock_writes_only_session_area() {
        let h = harness(60);
        let state = h.supervisor.unlock("secret").await.unwrap();
        assert!(state.unlocked);
        assert_eq!(
            h.session_area.get(PASSCODE_KEY).await.unwrap(),
            Some(json!("secret"))
        );
        assert!(h.session_area.get(EXPIRY_KEY).await.unwrap().is_some());
        assert_eq!(h.local_area.get(PASSCODE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_clears_session_and_queue_but_not_local_data() {
        let mut h = harness(60);
        h.local_area.set("settings", json!({"theme": "dark"})).await.unwrap();
        h.supervisor.unlock("secret").await.unwrap();
        h.store
            .enqueue("SIGN_REQUEST", json!({}), RoutingHints::default())
            .await
            .unwrap();

        h.supervisor.lock("user").await;

        assert!(!h.supervisor.is_unlocked().await);
        assert_eq!(h.session_area.get(PASSCODE_KEY).await.unwrap(), None);
        assert!(h.store.snapshot().await.unwrap().is_empty());
        assert_eq!(
            h.local_area.get("settings").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );

        assert!(matches!(
            h.events.recv().await.unwrap(),
            OutboundMessage::PendingRequestsChanged(_)
        ));
        match h.events.recv().await.unwrap() {
            OutboundMessage::SessionLocked(l) => assert_eq!(l.reason, "user"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_notifies_app_ports() {
        let h = harness(60);
        let (sink, mut rx) = ChannelSink::new();
        let port = PortId::from("ui");
        h.router.open_port(port.clone(), Arc::new(sink)).await;
        h.router
            .handle_message(
                &port,
                PortMessage::Hello(Hello {
                    context: PortContext::ExtensionApp,
                    instance_id: "ui".to_string(),
                    tab_id: None,
                    frame_id: None,
                }),
            )
            .await;
        let _ready = rx.recv().await;

        h.supervisor.lock("system locked").await;
        match rx.recv().await {
            Some(PortMessage::Event(e)) => {
                assert_eq!(e.name, "sessionLocked");
                assert_eq!(e.data, Some(json!({"reason": "system locked"})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expiry_locks_after_deadline() {
        let h = harness(60);
        h.supervisor.unlock("secret").await.unwrap();
        assert!(!h.supervisor.check_expiry(Utc::now()).await);
        assert!(
            h.supervisor
                .check_expiry(Utc::now() + chrono::Duration::seconds(61))
                .await
        );
        assert!(!h.supervisor.is_unlocked().await);
    }

    #[tokio::test]
    async fn test_activity_only_extends_unlocked_session() {
        let h = harness(60);
        assert_eq!(h.supervisor.record_activity().await, None);

        h.supervisor.unlock("secret").await.unwrap();
        let first = h.supervisor.state().await.expires_at_utc.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let extended = h.supervisor.record_activity().await.unwrap();
        assert!(extended >= first);
    }

    #[tokio::test]
    async fn test_system_lock_respects_config() {
        let h = harness(60);
        h.supervisor.unlock("secret").await.unwrap();
        assert!(!h.supervisor.on_idle_state(IdleState::Idle).await);
        assert!(h.supervisor.is_unlocked().await);
        assert!(h.supervisor.on_idle_state(IdleState::Locked).await);
        assert!(!h.supervisor.is_unlocked().await);
    }

    #[tokio::test]
    async fn test_restore_picks_up_live_session() {
        let h = harness(60);
        h.supervisor.unlock("secret").await.unwrap();

        let (tx, _rx) = broadcast::channel(4);
        let revived = SessionSupervisor::new(
            SessionConfig::default(),
            h.session_area.clone(),
            h.store.clone(),
            h.router.clone(),
            tx,
        );
        revived.restore().await.unwrap();
        assert!(revived.is_unlocked().await);
    }

    #[tokio::test]
    async fn test_restore_of_expired_session_locks() {
        let h = harness(60);
        h.session_area.set(PASSCODE_KEY, json!("secret")).await.unwrap();
        h.session_area
            .set(EXPIRY_KEY, serde_json::to_value(Utc::now() - chrono::Duration::seconds(1)).unwrap())
            .await
            .unwrap();
        h.supervisor.restore().await.unwrap();
        assert!(!h.supervisor.is_unlocked().await);
        assert_eq!(h.session_area.get(PASSCODE_KEY).await.unwrap(), None);
    }
}
