//! Client-side mirror of the server's entity directory and player roster
//!
//! RPCs from the server are applied here and forwarded to the entity host. Handlers
//! tolerate duplicates: a replayed or retried spawn for an id that already exists only
//! refreshes its authority flag.

use log::{debug, info, warn};
use shared::host::{EntityHandle, EntityHost};
use shared::rpc::{AuthorityFlags, DisconnectType, PlayerInfo, RpcBody, RpcEnvelope};
use shared::{PeerId, SERVER_ID};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaEntity {
    pub prefab_index: i32,
    pub handle: Option<EntityHandle>,
    pub flags: AuthorityFlags,
}

/// Something the session loop has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    None,
    /// The server removed this client
    Removed {
        disconnect_type: DisconnectType,
        reason: String,
    },
}

pub struct Replica {
    local_id: PeerId,
    entities: HashMap<i32, ReplicaEntity>,
    players: HashMap<PeerId, PlayerInfo>,
}

impl Replica {
    pub fn new(local_id: impl Into<PeerId>) -> Self {
        Self {
            local_id: local_id.into(),
            entities: HashMap::new(),
            players: HashMap::new(),
        }
    }

    pub fn apply<H: EntityHost>(&mut self, rpc: RpcEnvelope, host: &mut H) -> ReplicaEvent {
        let network_id = rpc.network_id;

        match rpc.body {
            RpcBody::Spawn {
                prefab_index,
                request_authority,
            } => {
                if let Some(entity) = self.entities.get_mut(&network_id) {
                    if request_authority && !entity.flags.local_authority_set {
                        entity.flags.local_authority_set = true;
                        if let Some(handle) = entity.handle {
                            host.on_authority_changed(handle, entity.flags);
                        }
                    }
                    return ReplicaEvent::None;
                }

                let handle = host.instantiate(prefab_index);
                if handle.is_none() {
                    warn!("Host cannot instantiate prefab {}", prefab_index);
                }
                let flags = AuthorityFlags {
                    local_set: true,
                    server_set: false,
                    local_authority_set: request_authority,
                };
                if let Some(handle) = handle {
                    host.on_authority_changed(handle, flags);
                }
                debug!("Spawned {} (prefab {})", network_id, prefab_index);
                self.entities.insert(
                    network_id,
                    ReplicaEntity {
                        prefab_index,
                        handle,
                        flags,
                    },
                );
            }
            RpcBody::Authorization(flags) => {
                if let Some(entity) = self.entities.get_mut(&network_id) {
                    entity.flags = flags;
                    if let Some(handle) = entity.handle {
                        host.on_authority_changed(handle, flags);
                    }
                }
            }
            RpcBody::Destroy => {
                if let Some(entity) = self.entities.remove(&network_id) {
                    if let Some(handle) = entity.handle {
                        host.destroy(handle);
                    }
                }
            }
            RpcBody::Transform(transform) => {
                if let Some(handle) = self.handle(network_id) {
                    host.set_transform(handle, transform);
                }
            }
            RpcBody::Custom { kind, payload } => {
                if let Some(handle) = self.handle(network_id) {
                    host.on_custom_rpc(handle, SERVER_ID, kind, &payload);
                }
            }
            RpcBody::PlayerConnected(player) => {
                if !self.players.contains_key(&player.peer_id) {
                    info!("{} joined", player.display_name);
                    host.on_player_connected(&player);
                }
                self.players.insert(player.peer_id.clone(), player);
            }
            RpcBody::PlayerDisconnected {
                player,
                disconnect_type,
                reason,
            } => {
                if player.peer_id == self.local_id {
                    return ReplicaEvent::Removed {
                        disconnect_type,
                        reason,
                    };
                }
                if self.players.remove(&player.peer_id).is_some() {
                    info!("{} left: {}", player.display_name, reason);
                    host.on_player_disconnected(&player, disconnect_type, &reason);
                }
            }
        }
        ReplicaEvent::None
    }

    fn handle(&self, network_id: i32) -> Option<EntityHandle> {
        self.entities.get(&network_id).and_then(|entity| entity.handle)
    }

    pub fn entity(&self, network_id: i32) -> Option<&ReplicaEntity> {
        self.entities.get(&network_id)
    }

    pub fn has_authority(&self, network_id: i32) -> bool {
        self.entities
            .get(&network_id)
            .is_some_and(|entity| entity.flags.local_authority_set)
    }

    pub fn player(&self, peer_id: &str) -> Option<&PlayerInfo> {
        self.players.get(peer_id)
    }

    /// This client's primary entity, once the server announced it
    pub fn own_network_id(&self) -> Option<i32> {
        self.players.get(&self.local_id).map(|player| player.network_id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
