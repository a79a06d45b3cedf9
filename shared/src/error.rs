//! Error taxonomy shared by the transport, the acceptor and the dialer.
//!
//! Transport- and decode-level errors are recovered where they happen (logged and
//! dropped). Authentication rejections travel over the wire as typed responses and only
//! become errors on the dialing side. `BindFailure` is the one error that is fatal at
//! startup.

use crate::PeerId;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// The bytes did not describe a recognized envelope
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame other than `Authentication` arrived from a sender that never passed it
    #[error("peer {0} is not authorized")]
    Unauthorized(PeerId),

    /// A mutating RPC arrived from a sender outside the entity's authority set
    #[error("peer {peer} has no authority over entity {network_id}")]
    AuthorityDenied { peer: PeerId, network_id: i32 },

    /// The retry budget for an important frame ran out
    #[error("peer {0} is unreachable")]
    PeerUnreachable(PeerId),

    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("lobby is full")]
    CapacityExceeded,

    #[error("banned: {0}")]
    Banned(String),

    #[error("incorrect password")]
    IncorrectPassword,

    /// The server answered with `Error` or `Unknown`
    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("no response after {0} connection attempts")]
    ConnectionFailed(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for NetError {
    fn from(err: bincode::Error) -> Self {
        NetError::MalformedFrame(err.to_string())
    }
}
