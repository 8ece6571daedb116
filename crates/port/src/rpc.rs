use portbridge_core::{PortSessionId, RpcResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const DISCONNECTED: &str = "port disconnected before a response arrived";

type Waiters = HashMap<String, oneshot::Sender<RpcResponse>>;

/// In-memory table of outstanding calls, keyed by session then request id.
///
/// Nothing here survives a worker restart. Every waiter is released exactly
/// once: by its response, by its timeout, or by `drain` when the session
/// closes. A caller that gives up early releases its waiter through
/// [`WaiterGuard`].
///
/// The table lock is never held across an await.
pub struct RpcCorrelator {
    pending: Mutex<HashMap<PortSessionId, Waiters>>,
    timeout: Duration,
    id_prefix: String,
    next_id: AtomicU64,
}

impl RpcCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            id_prefix: "sw".to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_id_prefix(mut self, prefix: &str) -> Self {
        self.id_prefix = prefix.to_string();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PortSessionId, Waiters>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_waiter(&self, session: &PortSessionId, request_id: &str) -> bool {
        let mut pending = self.table();
        let Some(waiters) = pending.get_mut(session) else {
            return false;
        };
        let removed = waiters.remove(request_id).is_some();
        if waiters.is_empty() {
            pending.remove(session);
        }
        removed
    }

    /// Forget `request_id` when the returned guard drops. Completed calls
    /// are already gone from the table, so dropping the guard after a
    /// response is a no-op.
    pub fn guard(&self, session: &PortSessionId, request_id: &str) -> WaiterGuard<'_> {
        WaiterGuard {
            rpc: self,
            session: session.clone(),
            request_id: request_id.to_string(),
        }
    }

    pub fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id_prefix, n)
    }

    pub async fn register(
        &self,
        session: &PortSessionId,
        request_id: &str,
    ) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.table();
        let waiters = pending.entry(session.clone()).or_default();
        if waiters.insert(request_id.to_string(), tx).is_some() {
            warn!(session = %session, request_id, "Replaced an outstanding call with the same id");
        }
        rx
    }

    /// Hand a response to its waiter. Returns false (and drops the response)
    /// when nobody is waiting for it.
    pub async fn complete(&self, response: RpcResponse) -> bool {
        let waiter = {
            let mut pending = self.table();
            let waiter = pending
                .get_mut(&response.port_session_id)
                .and_then(|w| w.remove(&response.id));
            if pending
                .get(&response.port_session_id)
                .is_some_and(|w| w.is_empty())
            {
                pending.remove(&response.port_session_id);
            }
            waiter
        };

        match waiter {
            Some(tx) => {
                let id = response.id.clone();
                if tx.send(response).is_err() {
                    debug!(request_id = %id, "Caller stopped waiting before the response arrived");
                }
                true
            }
            None => {
                debug!(
                    session = %response.port_session_id,
                    request_id = %response.id,
                    "Discarding response for unknown request"
                );
                false
            }
        }
    }

    pub async fn forget(&self, session: &PortSessionId, request_id: &str) {
        self.remove_waiter(session, request_id);
    }

    /// Fail every outstanding call of `session` with a locally built response.
    pub async fn drain(&self, session: &PortSessionId, reason: &str) -> usize {
        let waiters = {
            let mut pending = self.table();
            pending.remove(session).unwrap_or_default()
        };
        let count = waiters.len();
        for (id, tx) in waiters {
            let _ = tx.send(RpcResponse::failure(session.clone(), &id, reason));
        }
        if count > 0 {
            debug!(session = %session, count, "Drained outstanding calls");
        }
        count
    }

    pub async fn outstanding(&self, session: &PortSessionId) -> usize {
        let pending = self.table();
        pending.get(session).map(|w| w.len()).unwrap_or(0)
    }

    /// Wait for a registered call, bounded by the configured timeout.
    pub async fn wait(
        &self,
        session: &PortSessionId,
        request_id: &str,
        rx: oneshot::Receiver<RpcResponse>,
    ) -> RpcResponse {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => RpcResponse::failure(session.clone(), request_id, DISCONNECTED),
            Err(_) => {
                self.forget(session, request_id).await;
                warn!(session = %session, request_id, "RPC call timed out");
                RpcResponse::failure(
                    session.clone(),
                    request_id,
                    format!("request timed out after {} ms", self.timeout.as_millis()),
                )
            }
        }
    }
}

/// Removes one outstanding call from its correlator on drop.
///
/// Held by a caller for as long as it is interested in the response, so a
/// caller that is cancelled mid-await leaves nothing behind in the table.
pub struct WaiterGuard<'a> {
    rpc: &'a RpcCorrelator,
    session: PortSessionId,
    request_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.rpc.remove_waiter(&self.session, &self.request_id) {
            debug!(session = %self.session, request_id = %self.request_id, "Abandoned call forgotten");
        }
    }
}
