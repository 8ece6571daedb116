use chrono::{DateTime, Utc};
use portbridge_core::message::PendingDecision;
use portbridge_core::{
    Error, PendingBwAppRequest, PendingBwAppRequests, Result, RoutingHints, RpcResponse,
};
use portbridge_port::PortRouter;
use portbridge_storage::StorageArea;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What happened to a resolved request.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub request_id: String,
    /// The entry existed and has been removed.
    pub found: bool,
    /// The answer reached the original caller.
    pub delivered: bool,
}

/// Durable, ordered queue of requests waiting for a human decision.
///
/// The queue lives under one key of a storage area. All mutations go
/// through [`PendingRequestStore::mutate`], which holds a single write lock
/// across read, transform and write, so no two writers ever start from the
/// same stale snapshot.
pub struct PendingRequestStore {
    area: Arc<dyn StorageArea>,
    key: String,
    write_lock: Mutex<()>,
}

impl PendingRequestStore {
    pub fn new(area: Arc<dyn StorageArea>, key: &str) -> Self {
        Self {
            area,
            key: key.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<PendingBwAppRequests> {
        match self.area.get(&self.key).await? {
            None | Some(Value::Null) => Ok(PendingBwAppRequests::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::Storage(format!("pending request queue is unreadable: {}", e))),
        }
    }

    /// Current contents. The returned value is a private copy.
    pub async fn snapshot(&self) -> Result<PendingBwAppRequests> {
        self.load().await
    }

    /// Atomic read-modify-write. Nothing is written when the transform
    /// returns an unchanged collection or when the read fails.
    pub async fn mutate<R>(
        &self,
        transform: impl FnOnce(&PendingBwAppRequests) -> (PendingBwAppRequests, R),
    ) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let current = self.load().await?;
        let (next, out) = transform(&current);
        if next != current {
            self.area
                .set(&self.key, serde_json::to_value(&next)?)
                .await?;
        }
        Ok(out)
    }

    pub async fn enqueue(&self, kind: &str, payload: Value, hints: RoutingHints) -> Result<String> {
        let request = PendingBwAppRequest::new(kind, payload, hints);
        let request_id = request.request_id.clone();
        let tab_id = request.tab_id;
        self.mutate(|current| (current.with_added(request), ())).await?;
        info!(request_id = %request_id, kind, tab_id = ?tab_id, "Pending request queued");
        Ok(request_id)
    }

    pub async fn list(&self, kind: Option<&str>) -> Result<Vec<PendingBwAppRequest>> {
        let snapshot = self.load().await?;
        let requests = match kind {
            Some(kind) => snapshot.of_type(kind).cloned().collect(),
            None => snapshot.to_vec(),
        };
        Ok(requests)
    }

    /// Oldest entry of the given type, left in place.
    pub async fn peek(&self, kind: &str) -> Result<Option<PendingBwAppRequest>> {
        let snapshot = self.load().await?;
        let oldest = snapshot.of_type(kind).next().cloned();
        Ok(oldest)
    }

    pub async fn remove(&self, request_id: &str) -> Result<Option<PendingBwAppRequest>> {
        self.mutate(|current| {
            let removed = current.get(request_id).cloned();
            (current.without(request_id), removed)
        })
        .await
    }

    pub async fn remove_where(
        &self,
        predicate: impl Fn(&PendingBwAppRequest) -> bool,
    ) -> Result<Vec<PendingBwAppRequest>> {
        self.mutate(|current| {
            let removed: Vec<_> = current.iter().filter(|r| predicate(r)).cloned().collect();
            (current.retained(|r| !predicate(r)), removed)
        })
        .await
    }

    pub async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .mutate(|current| {
                let next = current.without_older_than(cutoff);
                let removed = current.len() - next.len();
                (next, removed)
            })
            .await?;
        if removed > 0 {
            debug!(removed, "Pruned stale pending requests");
        }
        Ok(removed)
    }

    /// Drop every entry. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        self.mutate(|current| (PendingBwAppRequests::new(), current.len()))
            .await
    }

    /// Remove the entry and try to hand the decision to whoever asked.
    ///
    /// Removal happens first and under the write lock, so of two racing
    /// resolutions only one ever sees the entry. Delivery failing is not a
    /// reason to keep it: the caller is gone.
    ///
    /// Delivery needs the original port to still carry the original session.
    /// An entry raised from a tab additionally needs that session to still be
    /// bound to the same tab. An entry without a tab is delivered to the live
    /// session whether or not it is attached, since there is no binding to
    /// check it against.
    pub async fn resolve(&self, router: &PortRouter, decision: PendingDecision) -> Result<Resolution> {
        let request_id = decision.request_id.clone();
        let Some(entry) = self.remove(&request_id).await? else {
            debug!(request_id = %request_id, "Resolve for unknown pending request");
            return Ok(Resolution {
                request_id,
                found: false,
                delivered: false,
            });
        };

        let delivered = deliver(router, &entry, decision).await;
        info!(request_id = %request_id, kind = %entry.kind, delivered, "Pending request resolved");
        Ok(Resolution {
            request_id,
            found: true,
            delivered,
        })
    }
}

async fn deliver(router: &PortRouter, entry: &PendingBwAppRequest, decision: PendingDecision) -> bool {
    let (Some(port_id), Some(session_id), Some(rpc_id)) = (
        entry.port_id.as_ref(),
        entry.port_session_id.as_ref(),
        entry.rpc_request_id.as_ref(),
    ) else {
        return false;
    };

    let Some(session) = router.live_session(port_id, session_id).await else {
        debug!(request_id = %entry.request_id, session = %session_id, "Original session is gone");
        return false;
    };
    if entry.tab_id.is_some() && session.bound_tab() != entry.tab_id {
        warn!(
            request_id = %entry.request_id,
            expected_tab = ?entry.tab_id,
            bound_tab = ?session.bound_tab(),
            "Original session no longer bound to the request's tab"
        );
        return false;
    }

    let response = if decision.ok {
        RpcResponse::success(session_id.clone(), rpc_id, decision.result)
    } else {
        RpcResponse::failure(
            session_id.clone(),
            rpc_id,
            decision.error.unwrap_or_else(|| "request declined".to_string()),
        )
    };
    router.respond(port_id, response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_core::message::Hello;
    use portbridge_core::{PortContext, PortId, PortMessage, PortSessionId};
    use portbridge_port::{ChannelSink, Routed, RpcCorrelator};
    use portbridge_storage::{AreaName, FileArea, MemoryArea};
    use serde_json::json;
    use std::time::Duration;

    fn store() -> PendingRequestStore {
        PendingRequestStore::new(Arc::new(MemoryArea::new(AreaName::Local)), "pending")
    }

    fn tab(tab_id: i64) -> RoutingHints {
        RoutingHints {
            tab_id: Some(tab_id),
            ..Default::default()
        }
    }

    fn decision(request_id: &str, ok: bool) -> PendingDecision {
        PendingDecision {
            request_id: request_id.to_string(),
            ok,
            result: ok.then(|| json!({"approved": true})),
            error: (!ok).then(|| "user declined".to_string()),
        }
    }

    fn router() -> PortRouter {
        PortRouter::new(RpcCorrelator::new(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_enqueue_then_resolve_removes_exactly_that_id() {
        let store = store();
        let router = router();
        let a = store.enqueue("SIGN_REQUEST", json!({"n": 1}), tab(1)).await.unwrap();
        let b = store.enqueue("UPDATE_NOTICE", json!({}), RoutingHints::default()).await.unwrap();
        let c = store.enqueue("SIGN_REQUEST", json!({"n": 3}), tab(3)).await.unwrap();

        let res = store.resolve(&router, decision(&b, true)).await.unwrap();
        assert!(res.found);
        assert!(!res.delivered);

        let ids: Vec<_> = store.list(None).await.unwrap().into_iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[tokio::test]
    async fn test_resolve_without_routing_removes_without_delivery() {
        let store = store();
        let router = router();
        let id = store.enqueue("SIGN_REQUEST", json!({}), tab(42)).await.unwrap();
        let res = store.resolve(&router, decision(&id, false)).await.unwrap();
        assert_eq!(
            res,
            Resolution {
                request_id: id,
                found: true,
                delivered: false
            }
        );
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let store = store();
        let res = store.resolve(&router(), decision("nope", true)).await.unwrap();
        assert!(!res.found);
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_live_session() {
        let store = store();
        let router = router();
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
        let _ready = rx.recv().await;

        let id = store
            .enqueue(
                "SIGN_REQUEST",
                json!({}),
                RoutingHints {
                    tab_id: Some(42),
                    tab_url: Some("https://example.com".to_string()),
                    port_id: Some(port_id.clone()),
                    port_session_id: Some(session.id.clone()),
                    rpc_request_id: Some("q7".to_string()),
                },
            )
            .await
            .unwrap();

        let res = store.resolve(&router, decision(&id, true)).await.unwrap();
        assert!(res.delivered);
        match rx.recv().await {
            Some(PortMessage::ContentScriptRpcResponse(resp)) => {
                assert_eq!(resp.id, "q7");
                assert!(resp.ok);
                assert_eq!(resp.port_session_id, session.id);
            }
            other => panic!("unexpected {:?}", other),
        }

        // a second resolution of the same id finds nothing
        let again = store.resolve(&router, decision(&id, true)).await.unwrap();
        assert!(!again.found);
    }

    #[tokio::test]
    async fn test_tab_binding_only_checked_for_tabbed_entries() {
        let store = store();
        let router = router();
        let (sink, mut rx) = ChannelSink::new();
        let port_id = PortId::from("ui-port");
        router.open_port(port_id.clone(), Arc::new(sink)).await;
        let session = match router
            .handle_message(
                &port_id,
                PortMessage::Hello(Hello {
                    context: PortContext::ExtensionApp,
                    instance_id: "ui".to_string(),
                    tab_id: None,
                    frame_id: None,
                }),
            )
            .await
        {
            Routed::Established(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        let _ready = rx.recv().await;
        let hints = |tab_id, rpc_id: &str| RoutingHints {
            tab_id,
            tab_url: None,
            port_id: Some(port_id.clone()),
            port_session_id: Some(session.id.clone()),
            rpc_request_id: Some(rpc_id.to_string()),
        };

        let untabbed = store.enqueue("SIGN_REQUEST", json!({}), hints(None, "q1")).await.unwrap();
        let tabbed = store.enqueue("SIGN_REQUEST", json!({}), hints(Some(5), "q2")).await.unwrap();

        // no tab on the entry: any live session with that id will do
        assert!(store.resolve(&router, decision(&untabbed, true)).await.unwrap().delivered);
        match rx.recv().await {
            Some(PortMessage::RpcResponse(resp)) => assert_eq!(resp.id, "q1"),
            other => panic!("unexpected {:?}", other),
        }

        // a tab on the entry: the unbound session does not qualify
        let res = store.resolve(&router, decision(&tabbed, true)).await.unwrap();
        assert!(res.found);
        assert!(!res.delivered);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_after_reconnect_is_not_delivered() {
        let store = store();
        let router = router();
        let id = store
            .enqueue(
                "SIGN_REQUEST",
                json!({}),
                RoutingHints {
                    tab_id: Some(1),
                    tab_url: None,
                    port_id: Some(PortId::from("old-port")),
                    port_session_id: Some(PortSessionId::from("old-session")),
                    rpc_request_id: Some("q1".to_string()),
                },
            )
            .await
            .unwrap();
        let res = store.resolve(&router, decision(&id, true)).await.unwrap();
        assert!(res.found);
        assert!(!res.delivered);
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_are_not_lost() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.enqueue("SIGN_REQUEST", json!({"i": i}), tab(i)).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        let stored = store.snapshot().await.unwrap();
        assert_eq!(stored.len(), 16);
        for id in ids {
            assert!(stored.get(&id).is_some());
        }
    }

    #[tokio::test]
    async fn test_two_concurrent_enqueues_on_file_area() {
        let dir = tempfile::tempdir().unwrap();
        let area = Arc::new(FileArea::new(AreaName::Local, dir.path().join("local.json")));
        let store = Arc::new(PendingRequestStore::new(area.clone(), "pending"));

        let (a, b) = tokio::join!(
            store.enqueue("SIGN_REQUEST", json!({}), tab(1)),
            store.enqueue("UPDATE_NOTICE", json!({}), RoutingHints::default()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // read through a fresh store to prove both made it to disk
        let reopened = PendingRequestStore::new(area, "pending");
        let stored = reopened.snapshot().await.unwrap();
        assert!(stored.get(&a).is_some());
        assert!(stored.get(&b).is_some());
    }

    #[tokio::test]
    async fn test_peek_and_list_by_type() {
        let store = store();
        let first = store.enqueue("SIGN_REQUEST", json!({"n": 1}), tab(1)).await.unwrap();
        store.enqueue("UPDATE_NOTICE", json!({}), RoutingHints::default()).await.unwrap();
        store.enqueue("SIGN_REQUEST", json!({"n": 2}), tab(2)).await.unwrap();

        let peeked = store.peek("SIGN_REQUEST").await.unwrap().unwrap();
        assert_eq!(peeked.request_id, first);
        assert_eq!(store.list(Some("SIGN_REQUEST")).await.unwrap().len(), 2);
        assert_eq!(store.list(Some("UPDATE_NOTICE")).await.unwrap().len(), 1);
        assert!(store.peek("NOTHING").await.unwrap().is_none());
        // peeking does not consume
        assert_eq!(store.snapshot().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_older_than() {
        let store = store();
        let keep = store.enqueue("SIGN_REQUEST", json!({}), tab(1)).await.unwrap();
        store
            .mutate(|current| {
                let mut old = PendingBwAppRequest::new("SIGN_REQUEST", json!({}), tab(2));
                old.created_at_utc = Utc::now() - chrono::Duration::days(2);
                let mut all = vec![old];
                all.extend(current.to_vec());
                (PendingBwAppRequests::from_vec(all), ())
            })
            .await
            .unwrap();

        let removed = store
            .remove_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot().await.unwrap().request_ids(), vec![keep]);
    }

    #[tokio::test]
    async fn test_unreadable_queue_is_a_storage_error() {
        let area = Arc::new(MemoryArea::new(AreaName::Local));
        area.set("pending", json!({"not": "a list"})).await.unwrap();
        let store = PendingRequestStore::new(area.clone(), "pending");

        assert!(matches!(store.snapshot().await, Err(Error::Storage(_))));
        assert!(store.clear().await.is_err());
        // nothing was written over the unreadable value
        assert_eq!(area.get("pending").await.unwrap(), Some(json!({"not": "a list"})));
    }
}
