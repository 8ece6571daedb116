pub mod router;
pub mod rpc;
pub mod session;
pub mod transport;

pub use router::{PortRouter, Routed};
pub use rpc::{RpcCorrelator, WaiterGuard};
pub use session::{AttachError, PortSession, SessionState};
pub use transport::{ChannelSink, PortSink};
