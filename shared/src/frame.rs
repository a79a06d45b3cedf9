//! Wire envelope and its typed variants

use crate::rpc::RpcEnvelope;
use crate::{NetError, PeerId};
use serde::{Deserialize, Serialize};

/// Frame id carried until the send loop stamps the frame
pub const UNASSIGNED_FRAME_ID: i32 = -1;

/// Type tag of the base envelope, written as a single byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Handshake,
    Ping,
    Authentication,
    Rpc,
    Heartbeat,
    Acknowledged,
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> u8 {
        match frame_type {
            FrameType::Handshake => 0,
            FrameType::Ping => 1,
            FrameType::Authentication => 2,
            FrameType::Rpc => 3,
            FrameType::Heartbeat => 4,
            FrameType::Acknowledged => 5,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = NetError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(FrameType::Handshake),
            1 => Ok(FrameType::Ping),
            2 => Ok(FrameType::Authentication),
            3 => Ok(FrameType::Rpc),
            4 => Ok(FrameType::Heartbeat),
            5 => Ok(FrameType::Acknowledged),
            other => Err(NetError::MalformedFrame(format!("unknown frame tag {}", other))),
        }
    }
}

/// Answer the acceptor gives to an `Authentication` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuthResponse {
    LobbyFull,
    Banned,
    Error,
    IncorrectPassword,
    Unknown,
    Connected,
}

impl From<AuthResponse> for u8 {
    fn from(response: AuthResponse) -> u8 {
        match response {
            AuthResponse::LobbyFull => 0,
            AuthResponse::Banned => 1,
            AuthResponse::Error => 2,
            AuthResponse::IncorrectPassword => 3,
            AuthResponse::Unknown => 4,
            AuthResponse::Connected => 5,
        }
    }
}

impl TryFrom<u8> for AuthResponse {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            0 => Ok(AuthResponse::LobbyFull),
            1 => Ok(AuthResponse::Banned),
            2 => Ok(AuthResponse::Error),
            3 => Ok(AuthResponse::IncorrectPassword),
            4 => Ok(AuthResponse::Unknown),
            5 => Ok(AuthResponse::Connected),
            other => Err(format!("unknown authentication response {}", other)),
        }
    }
}

impl AuthResponse {
    /// Maps a response onto the dialer's view: `Ok` only for `Connected`
    pub fn into_result(self, message: &str) -> Result<(), NetError> {
        match self {
            AuthResponse::Connected => Ok(()),
            AuthResponse::IncorrectPassword => Err(NetError::IncorrectPassword),
            AuthResponse::Banned => Err(NetError::Banned(message.to_string())),
            AuthResponse::LobbyFull => Err(NetError::CapacityExceeded),
            AuthResponse::Error | AuthResponse::Unknown => {
                Err(NetError::Rejected(format!("{:?}: {}", self, message)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub password: String,
    pub response: AuthResponse,
    pub message: String,
}

impl Authentication {
    pub fn request(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            response: AuthResponse::Unknown,
            message: String::new(),
        }
    }

    pub fn response(response: AuthResponse, message: impl Into<String>) -> Self {
        Self {
            password: String::new(),
            response,
            message: message.into(),
        }
    }
}

/// Type-specific part of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Handshake { display_name: String },
    Ping,
    Authentication(Authentication),
    Rpc(RpcEnvelope),
    Heartbeat,
    Acknowledged { acked_frame_id: i32 },
}

impl FrameBody {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::Handshake { .. } => FrameType::Handshake,
            FrameBody::Ping => FrameType::Ping,
            FrameBody::Authentication(_) => FrameType::Authentication,
            FrameBody::Rpc(_) => FrameType::Rpc,
            FrameBody::Heartbeat => FrameType::Heartbeat,
            FrameBody::Acknowledged { .. } => FrameType::Acknowledged,
        }
    }
}

/// Base envelope fields, readable without knowing the body
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub frame_id: i32,
    pub sender_id: PeerId,
    pub target_id: PeerId,
    pub important: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_id: i32,
    pub sender_id: PeerId,
    pub target_id: PeerId,
    pub important: bool,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(
        body: FrameBody,
        sender_id: impl Into<PeerId>,
        target_id: impl Into<PeerId>,
    ) -> Self {
        Self {
            frame_id: UNASSIGNED_FRAME_ID,
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            important: false,
            body,
        }
    }

    /// Wraps an RPC, inheriting its importance
    pub fn rpc(
        rpc: RpcEnvelope,
        sender_id: impl Into<PeerId>,
        target_id: impl Into<PeerId>,
    ) -> Self {
        let important = rpc.important;
        Self::new(FrameBody::Rpc(rpc), sender_id, target_id).with_important(important)
    }

    pub fn with_important(mut self, important: bool) -> Self {
        self.important = important;
        self
    }

    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    pub fn is_assigned(&self) -> bool {
        self.frame_id != UNASSIGNED_FRAME_ID
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            frame_type: self.frame_type(),
            frame_id: self.frame_id,
            sender_id: self.sender_id.clone(),
            target_id: self.target_id.clone(),
            important: self.important,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_tags_are_stable() {
        let all = [
            FrameType::Handshake,
            FrameType::Ping,
            FrameType::Authentication,
            FrameType::Rpc,
            FrameType::Heartbeat,
            FrameType::Acknowledged,
        ];
        for (expected, frame_type) in all.iter().enumerate() {
            let tag: u8 = (*frame_type).into();
            assert_eq!(tag as usize, expected);
            assert_eq!(FrameType::try_from(tag).unwrap(), *frame_type);
        }
        assert!(FrameType::try_from(6).is_err());
    }

    #[test]
    fn test_new_frame_is_unassigned() {
        let frame = Frame::new(FrameBody::Ping, "alice", crate::SERVER_ID);
        assert_eq!(frame.frame_id, UNASSIGNED_FRAME_ID);
        assert!(!frame.is_assigned());
        assert!(!frame.important);
        assert_eq!(frame.frame_type(), FrameType::Ping);
    }

    #[test]
    fn test_auth_response_into_result() {
        assert!(AuthResponse::Connected.into_result("").is_ok());
        assert!(matches!(
            AuthResponse::IncorrectPassword.into_result(""),
            Err(NetError::IncorrectPassword)
        ));
        assert!(matches!(
            AuthResponse::LobbyFull.into_result(""),
            Err(NetError::CapacityExceeded)
        ));
        match AuthResponse::Banned.into_result("spamming") {
            Err(NetError::Banned(reason)) => assert_eq!(reason, "spamming"),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            AuthResponse::Error.into_result("server_error_proxy"),
            Err(NetError::Rejected(_))
        ));
    }

    #[test]
    fn test_header_mirrors_frame() {
        let frame = Frame::new(FrameBody::Heartbeat, crate::SERVER_ID, "bob").with_important(true);
        let header = frame.header();
        assert_eq!(header.frame_type, FrameType::Heartbeat);
        assert_eq!(header.sender_id, crate::SERVER_ID);
        assert_eq!(header.target_id, "bob");
        assert!(header.important);
    }
}
