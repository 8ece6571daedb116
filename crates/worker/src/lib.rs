pub mod handler;
pub mod orphan;
pub mod request_store;
pub mod supervisor;
pub mod worker;

pub use handler::{ApprovalHandler, HandlerOutcome, HandlerRegistry, IncomingCall, PingHandler, RpcHandler};
pub use orphan::{cleanup_all_pending_requests, is_orphaned, reconcile_for_app_session};
pub use request_store::{PendingRequestStore, Resolution};
pub use supervisor::{SessionSupervisor, EXPIRY_KEY, PASSCODE_KEY};
pub use worker::BackgroundWorker;
