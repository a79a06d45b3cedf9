//! Wire protocol and transport shared by the server and client crates

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod host;
pub mod reliability;
pub mod rpc;
pub mod transport;

pub use error::NetError;
pub use frame::{AuthResponse, Authentication, Frame, FrameBody, FrameType};
pub use host::{EntityHandle, EntityHost, HeadlessHost};
pub use rpc::{
    AuthorityFlags, DisconnectType, PlayerInfo, RpcBody, RpcEnvelope, RpcKind, Transform,
};
pub use transport::{FrameSender, Transport, TransportEvent};

/// Stable, transport-independent peer identifier
pub type PeerId = String;

/// Reserved id of the accepting side
pub const SERVER_ID: &str = "server";
/// Reserved id of the frame relay
pub const PROXY_ID: &str = "proxy";

/// Reason reported for heartbeat and reliability timeouts
pub const LOST_CONNECTION: &str = "Lost Connection";
