use portbridge_core::{PendingBwAppRequest, TabId};
use portbridge_port::PortSession;
use tracing::{info, warn};

use crate::request_store::PendingRequestStore;

/// Whether `request` can no longer be answered once a UI session bound to
/// `ui_tab` exists.
///
/// An unbound UI (no tab) claims every request. A bound UI claims only the
/// requests raised from its own tab.
pub fn is_orphaned(request: &PendingBwAppRequest, ui_tab: Option<TabId>) -> bool {
    match ui_tab {
        None => true,
        Some(tab) => request.tab_id == Some(tab),
    }
}

/// Drop the requests orphaned by `session` and return their ids.
///
/// Storage failures are logged and leave the queue as it was.
pub async fn reconcile_for_app_session(
    store: &PendingRequestStore,
    session: &PortSession,
) -> Vec<String> {
    if !session.is_app() {
        return Vec::new();
    }
    let ui_tab = session.bound_tab();
    match store.remove_where(|r| is_orphaned(r, ui_tab)).await {
        Ok(removed) => {
            let ids: Vec<String> = removed.into_iter().map(|r| r.request_id).collect();
            if !ids.is_empty() {
                info!(
                    session = %session.id,
                    ui_tab = ?ui_tab,
                    removed = ids.len(),
                    "Discarded orphaned pending requests"
                );
            }
            ids
        }
        Err(e) => {
            warn!(session = %session.id, error = %e, "Orphan reconciliation skipped");
            Vec::new()
        }
    }
}

/// Forced teardown: discard the whole queue without replying to anyone.
pub async fn cleanup_all_pending_requests(store: &PendingRequestStore, reason: &str) -> Vec<String> {
    let result = store
        .mutate(|current| (Default::default(), current.request_ids()))
        .await;
    match result {
        Ok(ids) => {
            info!(reason, removed = ids.len(), "Cleared all pending requests");
            ids
        }
        Err(e) => {
            warn!(reason, error = %e, "Could not clear pending requests");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_core::message::Hello;
    use portbridge_core::{PortContext, PortId, PortMessage, RoutingHints};
    use portbridge_port::{ChannelSink, PortRouter, Routed, RpcCorrelator};
    use portbridge_storage::{AreaName, MemoryArea, StorageArea};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> PendingRequestStore {
        PendingRequestStore::new(Arc::new(MemoryArea::new(AreaName::Local)), "pending")
    }

    fn request(tab_id: Option<TabId>) -> PendingBwAppRequest {
        PendingBwAppRequest::new(
            "SIGN_REQUEST",
            json!({}),
            RoutingHints {
                tab_id,
                ..Default::default()
            },
        )
    }

    fn app_session(tab_id: Option<TabId>) -> PortSession {
        PortSession::establish(&Hello {
            context: PortContext::ExtensionApp,
            instance_id: "ui".to_string(),
            tab_id,
            frame_id: None,
        })
    }

    #[test]
    fn test_unbound_ui_orphans_everything() {
        assert!(is_orphaned(&request(Some(42)), None));
        assert!(is_orphaned(&request(None), None));
    }

    #[test]
    fn test_bound_ui_orphans_only_its_tab() {
        assert!(is_orphaned(&request(Some(42)), Some(42)));
        assert!(!is_orphaned(&request(Some(42)), Some(99)));
        assert!(!is_orphaned(&request(None), Some(99)));
    }

    #[tokio::test]
    async fn test_reconcile_removes_only_same_tab() {
        let store = store();
        let r1 = store
            .enqueue("SIGN_REQUEST", json!({}), RoutingHints { tab_id: Some(42), ..Default::default() })
            .await
            .unwrap();
        let r2 = store
            .enqueue("SIGN_REQUEST", json!({}), RoutingHints { tab_id: Some(43), ..Default::default() })
            .await
            .unwrap();

        let removed = reconcile_for_app_session(&store, &app_session(Some(42))).await;
        assert_eq!(removed, vec![r1]);
        assert_eq!(store.snapshot().await.unwrap().request_ids(), vec![r2]);
    }

    #[tokio::test]
    async fn test_reconcile_unbound_ui_clears_queue() {
        let store = store();
        store.enqueue("SIGN_REQUEST", json!({}), RoutingHints::default()).await.unwrap();
        store
            .enqueue("SIGN_REQUEST", json!({}), RoutingHints { tab_id: Some(5), ..Default::default() })
            .await
            .unwrap();

        let removed = reconcile_for_app_session(&store, &app_session(None)).await;
        assert_eq!(removed.len(), 2);
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_script_session_never_reconciles() {
        let store = store();
        store
            .enqueue("SIGN_REQUEST", json!({}), RoutingHints { tab_id: Some(42), ..Default::default() })
            .await
            .unwrap();
        let cs = PortSession::establish(&Hello {
            context: PortContext::ContentScript,
            instance_id: "cs".to_string(),
            tab_id: Some(42),
            frame_id: None,
        });
        assert!(reconcile_for_app_session(&store, &cs).await.is_empty());
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let store = store();
        let a = store.enqueue("A", json!({}), RoutingHints::default()).await.unwrap();
        let b = store.enqueue("B", json!({}), RoutingHints::default()).await.unwrap();
        let removed = cleanup_all_pending_requests(&store, "session locked").await;
        assert_eq!(removed, vec![a, b]);
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_never_replies_to_live_caller() {
        let store = store();
        let router = PortRouter::new(RpcCorrelator::new(Duration::from_secs(1)));
        let (sink, mut rx) = ChannelSink::new();
        let port_id = PortId::from("cs-port");
        router.open_port(port_id.clone(), Arc::new(sink)).await;
        let session = match router
            .handle_message(
                &port_id,
                PortMessage::Hello(Hello {
                    context: PortContext::ContentScript,
                    instance_id: "cs".to_string(),
                    tab_id: Some(42),
                    frame_id: None,
                }),
            )
            .await
        {
            Routed::Established(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(rx.recv().await, Some(PortMessage::Ready(_))));

        let id = store
            .enqueue(
                "SIGN_REQUEST",
                json!({}),
                RoutingHints {
                    tab_id: Some(42),
                    tab_url: Some("https://example.com".to_string()),
                    port_id: Some(port_id.clone()),
                    port_session_id: Some(session.id.clone()),
                    rpc_request_id: Some("q1".to_string()),
                },
            )
            .await
            .unwrap();
        assert!(router.live_session(&port_id, &session.id).await.is_some());

        let removed = cleanup_all_pending_requests(&store, "session locked").await;
        assert_eq!(removed, vec![id]);
        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(rx.try_recv().is_err(), "cleanup must not answer the caller");
    }

    #[tokio::test]
    async fn test_cleanup_with_unreadable_queue_changes_nothing() {
        let area = Arc::new(MemoryArea::new(AreaName::Local));
        area.set("pending", json!("garbage")).await.unwrap();
        let store = PendingRequestStore::new(area.clone(), "pending");

        assert!(cleanup_all_pending_requests(&store, "test").await.is_empty());
        assert_eq!(area.get("pending").await.unwrap(), Some(json!("garbage")));
    }
}
