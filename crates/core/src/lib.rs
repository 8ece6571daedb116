pub mod config;
pub mod error;
pub mod message;
pub mod pending;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{
    Decoded, ErrorCode, InboundMessage, OutboundMessage, PortMessage, RawInbound, RawOutbound,
    RpcRequest, RpcResponse,
};
pub use paths::Paths;
pub use pending::{PendingBwAppRequest, PendingBwAppRequests, RoutingHints};
pub use types::{FrameId, PortContext, PortId, PortSessionId, TabId};
