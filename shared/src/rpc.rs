//! Remote procedure envelopes carried inside `Rpc` frames
//!
//! An RPC addresses a replicated entity by network id and carries one of a closed set of
//! kinds. Session-level kinds (spawn, destroy, authority, player join/leave) are handled by
//! the transport layer itself; `Transform` and `Custom` are entity-level updates that are
//! authority-gated, cached for late joiners, and forwarded to the entity host.

use crate::{NetError, PeerId};
use serde::{Deserialize, Serialize};

/// Network id carried by a spawn request before the acceptor assigns one
pub const UNASSIGNED_NETWORK_ID: i32 = -1;

/// First tag reserved for application-defined RPC kinds
pub const CUSTOM_RPC_BASE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RpcKind {
    Spawn,
    Authorization,
    Destroy,
    Transform,
    PlayerConnected,
    PlayerDisconnected,
    Custom(u8),
}

impl From<RpcKind> for u8 {
    fn from(kind: RpcKind) -> u8 {
        match kind {
            RpcKind::Spawn => 1,
            RpcKind::Authorization => 2,
            RpcKind::Destroy => 3,
            RpcKind::Transform => 4,
            RpcKind::PlayerConnected => 5,
            RpcKind::PlayerDisconnected => 6,
            RpcKind::Custom(tag) => tag,
        }
    }
}

impl TryFrom<u8> for RpcKind {
    type Error = NetError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(RpcKind::Spawn),
            2 => Ok(RpcKind::Authorization),
            3 => Ok(RpcKind::Destroy),
            4 => Ok(RpcKind::Transform),
            5 => Ok(RpcKind::PlayerConnected),
            6 => Ok(RpcKind::PlayerDisconnected),
            tag if tag >= CUSTOM_RPC_BASE => Ok(RpcKind::Custom(tag)),
            other => Err(NetError::MalformedFrame(format!("unknown rpc kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f32; 3],
    /// Euler angles in degrees
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

impl Transform {
    pub fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

/// Role flags pushed by the acceptor for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorityFlags {
    pub local_set: bool,
    pub server_set: bool,
    pub local_authority_set: bool,
}

/// Public description of a connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub network_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DisconnectType {
    /// The peer asked to leave
    Request,
    /// Administrative removal, including liveness and reliability timeouts
    Kick,
}

impl From<DisconnectType> for u8 {
    fn from(kind: DisconnectType) -> u8 {
        match kind {
            DisconnectType::Request => 0,
            DisconnectType::Kick => 1,
        }
    }
}

impl TryFrom<u8> for DisconnectType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DisconnectType::Request),
            1 => Ok(DisconnectType::Kick),
            other => Err(format!("unknown disconnect type {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcBody {
    Spawn {
        prefab_index: i32,
        request_authority: bool,
    },
    Authorization(AuthorityFlags),
    Destroy,
    Transform(Transform),
    PlayerConnected(PlayerInfo),
    PlayerDisconnected {
        player: PlayerInfo,
        disconnect_type: DisconnectType,
        reason: String,
    },
    Custom {
        kind: u8,
        payload: Vec<u8>,
    },
}

impl RpcBody {
    pub fn kind(&self) -> RpcKind {
        match self {
            RpcBody::Spawn { .. } => RpcKind::Spawn,
            RpcBody::Authorization(_) => RpcKind::Authorization,
            RpcBody::Destroy => RpcKind::Destroy,
            RpcBody::Transform(_) => RpcKind::Transform,
            RpcBody::PlayerConnected(_) => RpcKind::PlayerConnected,
            RpcBody::PlayerDisconnected { .. } => RpcKind::PlayerDisconnected,
            RpcBody::Custom { kind, .. } => RpcKind::Custom(*kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub network_id: i32,
    pub important: bool,
    pub body: RpcBody,
}

impl RpcEnvelope {
    pub fn new(network_id: i32, body: RpcBody, important: bool) -> Self {
        Self {
            network_id,
            important,
            body,
        }
    }

    pub fn kind(&self) -> RpcKind {
        self.body.kind()
    }

    /// A spawn request as sent by a dialer, before an id exists
    pub fn spawn_request(prefab_index: i32, request_authority: bool) -> Self {
        Self::spawn(UNASSIGNED_NETWORK_ID, prefab_index, request_authority)
    }

    pub fn spawn(network_id: i32, prefab_index: i32, request_authority: bool) -> Self {
        Self::new(
            network_id,
            RpcBody::Spawn {
                prefab_index,
                request_authority,
            },
            true,
        )
    }

    pub fn authorization(network_id: i32, flags: AuthorityFlags) -> Self {
        Self::new(network_id, RpcBody::Authorization(flags), true)
    }

    pub fn destroy(network_id: i32) -> Self {
        Self::new(network_id, RpcBody::Destroy, true)
    }

    /// Transform updates are frequent and superseded quickly, so they are not retried
    pub fn transform(network_id: i32, transform: Transform) -> Self {
        Self::new(network_id, RpcBody::Transform(transform), false)
    }

    pub fn player_connected(player: PlayerInfo) -> Self {
        Self::new(player.network_id, RpcBody::PlayerConnected(player), true)
    }

    pub fn player_disconnected(
        player: PlayerInfo,
        disconnect_type: DisconnectType,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            player.network_id,
            RpcBody::PlayerDisconnected {
                player,
                disconnect_type,
                reason: reason.into(),
            },
            true,
        )
    }

    pub fn custom(network_id: i32, kind: u8, payload: Vec<u8>, important: bool) -> Self {
        Self::new(network_id, RpcBody::Custom { kind, payload }, important)
    }

    /// Entity-level updates gated by authority and replayed to late joiners
    pub fn is_entity_update(&self) -> bool {
        matches!(self.body, RpcBody::Transform(_) | RpcBody::Custom { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        let kinds = [
            RpcKind::Spawn,
            RpcKind::Authorization,
            RpcKind::Destroy,
            RpcKind::Transform,
            RpcKind::PlayerConnected,
            RpcKind::PlayerDisconnected,
            RpcKind::Custom(CUSTOM_RPC_BASE),
            RpcKind::Custom(255),
        ];
        for kind in kinds {
            let tag: u8 = kind.into();
            assert_eq!(RpcKind::try_from(tag).unwrap(), kind);
        }
    }

    #[test]
    fn test_reserved_tags_are_rejected() {
        assert!(RpcKind::try_from(0).is_err());
        assert!(RpcKind::try_from(7).is_err());
        assert!(RpcKind::try_from(CUSTOM_RPC_BASE - 1).is_err());
    }

    #[test]
    fn test_default_importance() {
        assert!(RpcEnvelope::spawn_request(3, true).important);
        assert!(RpcEnvelope::destroy(5).important);
        assert!(!RpcEnvelope::transform(5, Transform::default()).important);
        assert!(!RpcEnvelope::custom(5, 120, vec![], false).important);
    }

    #[test]
    fn test_spawn_request_is_unassigned() {
        let rpc = RpcEnvelope::spawn_request(2, false);
        assert_eq!(rpc.network_id, UNASSIGNED_NETWORK_ID);
        assert_eq!(rpc.kind(), RpcKind::Spawn);
    }

    #[test]
    fn test_entity_updates() {
        assert!(RpcEnvelope::transform(1, Transform::at([1.0, 2.0, 3.0])).is_entity_update());
        assert!(RpcEnvelope::custom(1, 101, vec![1], true).is_entity_update());
        assert!(!RpcEnvelope::destroy(1).is_entity_update());
    }
}
