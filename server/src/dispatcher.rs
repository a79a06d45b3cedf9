//! Authoritative RPC handling
//!
//! The dispatcher owns the peer table, the entity directory and the entity host. Every
//! operation mutates that state and returns the list of RPCs to send as [`Effect`]s; it
//! never touches the transport, so the session loop decides how effects hit the wire and
//! tests can inspect them directly.
//!
//! Operations take an `origin`: `Some(peer)` for RPCs that arrived from a peer, `None`
//! for operations the server performs itself, which always have authority.

use crate::directory::Directory;
use crate::peer_manager::PeerManager;
use log::{debug, info, warn};
use shared::config::{DisconnectPolicy, ServerConfig, SCENE_PREFAB};
use shared::host::EntityHost;
use shared::rpc::{AuthorityFlags, DisconnectType, PlayerInfo, RpcBody, RpcEnvelope, RpcKind};
use shared::{NetError, PeerId, SERVER_ID};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send { target: PeerId, rpc: RpcEnvelope },
    /// The peer's state is gone; its transport state can be dropped
    Disconnected { peer_id: PeerId },
}

pub struct RpcDispatcher<H: EntityHost> {
    peers: PeerManager,
    directory: Directory,
    host: H,
    player_prefab: i32,
    spawn_player_on_handshake: bool,
    grant_player_authority: bool,
    disconnect_policy: DisconnectPolicy,
}

impl<H: EntityHost> RpcDispatcher<H> {
    pub fn new(config: &ServerConfig, host: H) -> Self {
        Self::with_directory(config, host, Directory::new())
    }

    pub fn with_directory(config: &ServerConfig, host: H, directory: Directory) -> Self {
        Self {
            peers: PeerManager::new(config),
            directory,
            host,
            player_prefab: config.player_prefab,
            spawn_player_on_handshake: config.spawn_player_on_handshake,
            grant_player_authority: config.grant_player_authority,
            disconnect_policy: config.disconnect_policy,
        }
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerManager {
        &mut self.peers
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Creates the session for an authorized peer and brings it up to date
    ///
    /// Spawns the peer's primary entity if configured to, then replays every other live
    /// entity. A repeated handshake from a peer that already has a session is ignored.
    pub fn handshake(&mut self, peer_id: &str, display_name: &str) -> Vec<Effect> {
        if !self.peers.add_session(peer_id, display_name) {
            debug!("Ignoring handshake from {}", peer_id);
            return Vec::new();
        }

        let mut effects = Vec::new();
        let mut own_entity = None;

        if self.spawn_player_on_handshake {
            let (prefab, grant) = (self.player_prefab, self.grant_player_authority);
            match self.spawn(Some(peer_id), prefab, grant) {
                Ok(spawned) => effects.extend(spawned),
                Err(e) => warn!("Could not spawn player for {}: {}", peer_id, e),
            }
            own_entity = self.peers.session(peer_id).and_then(|peer| peer.network_id);
        }

        for rpc in self.directory.replay_for(peer_id, own_entity) {
            effects.push(Effect::Send {
                target: peer_id.to_string(),
                rpc,
            });
        }
        effects
    }

    /// Routes an RPC that arrived from `sender`
    ///
    /// RPCs naming an entity that no longer exists are dropped without error. Refusals
    /// are returned as errors for logging only; nothing is sent back to the sender.
    pub fn handle_rpc(&mut self, sender: &str, rpc: RpcEnvelope) -> Result<Vec<Effect>, NetError> {
        if self.peers.session(sender).is_none() {
            return Err(NetError::Unauthorized(sender.to_string()));
        }

        match rpc.body {
            RpcBody::Spawn {
                prefab_index,
                request_authority,
            } => self.spawn(Some(sender), prefab_index, request_authority),
            RpcBody::Destroy => self.destroy(Some(sender), rpc.network_id),
            RpcBody::Transform(_) | RpcBody::Custom { .. } => self.update(Some(sender), rpc),
            RpcBody::PlayerDisconnected { reason, .. } => {
                Ok(self.disconnect_peer(sender, DisconnectType::Request, &reason))
            }
            RpcBody::Authorization(_) | RpcBody::PlayerConnected(_) => {
                // Only the server constructs these
                Err(NetError::Unauthorized(sender.to_string()))
            }
        }
    }

    /// Spawns an entity and announces it to every peer with a session
    pub fn spawn(
        &mut self,
        origin: Option<&str>,
        prefab_index: i32,
        request_authority: bool,
    ) -> Result<Vec<Effect>, NetError> {
        self.spawn_entity(origin, prefab_index, request_authority)
            .map(|(_, effects)| effects)
    }

    /// Like [`spawn`](Self::spawn), also returning the assigned id if one was allocated
    pub fn spawn_entity(
        &mut self,
        origin: Option<&str>,
        prefab_index: i32,
        request_authority: bool,
    ) -> Result<(Option<i32>, Vec<Effect>), NetError> {
        if prefab_index == SCENE_PREFAB {
            if let Some(peer) = origin {
                return Err(NetError::AuthorityDenied {
                    peer: peer.to_string(),
                    network_id: shared::rpc::UNASSIGNED_NETWORK_ID,
                });
            }
        }

        let player_spawn = origin.is_some() && prefab_index == self.player_prefab;
        if let Some(peer) = origin {
            if player_spawn
                && self
                    .peers
                    .session(peer)
                    .is_some_and(|session| session.network_id.is_some())
            {
                debug!("{} already has a primary entity", peer);
                return Ok((None, Vec::new()));
            }
        }

        let Some(handle) = self.host.instantiate(prefab_index) else {
            warn!("Host cannot instantiate prefab {}", prefab_index);
            return Ok((None, Vec::new()));
        };

        let spawner = origin.unwrap_or(SERVER_ID);
        let network_id = self.directory.insert(prefab_index, spawner, Some(handle));
        let granted = request_authority && origin.is_some();
        if granted {
            if let Some(peer) = origin {
                self.directory.grant(network_id, peer);
            }
        }
        debug!(
            "Spawned prefab {} as {} for {}",
            prefab_index, network_id, spawner
        );

        let mut effects = Vec::new();
        for target in self.peers.session_ids() {
            let is_requester = Some(target.as_str()) == origin;
            effects.push(Effect::Send {
                rpc: RpcEnvelope::spawn(network_id, prefab_index, granted && is_requester),
                target,
            });
        }

        if let Some(peer) = origin {
            effects.push(Effect::Send {
                target: peer.to_string(),
                rpc: RpcEnvelope::authorization(
                    network_id,
                    AuthorityFlags {
                        local_set: true,
                        server_set: false,
                        local_authority_set: granted,
                    },
                ),
            });
        }

        if player_spawn {
            if let Some(peer) = origin {
                self.peers.set_network_id(peer, network_id);
                if let Some(info) = self.peers.session(peer).map(|s| s.player_info()) {
                    let connected = RpcEnvelope::player_connected(info.clone());
                    self.directory.cache(&connected);
                    self.broadcast(&connected, None, &mut effects);
                    self.host.on_player_connected(&info);
                    info!("{} is now player {}", peer, network_id);
                }
            }
        }

        Ok((Some(network_id), effects))
    }

    /// Destroys an entity if `origin` has authority over it
    pub fn destroy(
        &mut self,
        origin: Option<&str>,
        network_id: i32,
    ) -> Result<Vec<Effect>, NetError> {
        if !self.directory.contains(network_id) {
            debug!("Destroy for unknown entity {}", network_id);
            return Ok(Vec::new());
        }
        self.check_authority(origin, network_id)?;

        let mut effects = Vec::new();
        self.remove_entity(network_id, &mut effects);
        Ok(effects)
    }

    /// Applies a transform or custom RPC, caches it for replay and forwards it
    pub fn update(
        &mut self,
        origin: Option<&str>,
        rpc: RpcEnvelope,
    ) -> Result<Vec<Effect>, NetError> {
        let Some(handle) = self.directory.get(rpc.network_id).map(|r| r.handle) else {
            debug!("Update for unknown entity {}", rpc.network_id);
            return Ok(Vec::new());
        };
        self.check_authority(origin, rpc.network_id)?;

        if let Some(handle) = handle {
            match &rpc.body {
                RpcBody::Transform(transform) => self.host.set_transform(handle, *transform),
                RpcBody::Custom { kind, payload } => {
                    self.host
                        .on_custom_rpc(handle, origin.unwrap_or(SERVER_ID), *kind, payload)
                }
                _ => return Ok(Vec::new()),
            }
        }

        self.directory.cache(&rpc);
        let mut effects = Vec::new();
        self.broadcast(&rpc, origin, &mut effects);
        Ok(effects)
    }

    /// Removes a peer and everything that depends on it
    ///
    /// A kicked peer is told first, then the disconnect policy is applied to the
    /// entities it holds authority over, and the remaining peers learn that it left.
    pub fn disconnect_peer(
        &mut self,
        peer_id: &str,
        disconnect_type: DisconnectType,
        reason: &str,
    ) -> Vec<Effect> {
        if !self.peers.is_authorized(peer_id) {
            return Vec::new();
        }

        let session = self.peers.remove(peer_id);
        let info = session
            .as_ref()
            .map(|peer| peer.player_info())
            .unwrap_or_else(|| PlayerInfo {
                peer_id: peer_id.to_string(),
                display_name: String::new(),
                network_id: shared::rpc::UNASSIGNED_NETWORK_ID,
            });
        info!("{} disconnected ({:?}): {}", peer_id, disconnect_type, reason);

        let mut effects = Vec::new();
        if disconnect_type == DisconnectType::Kick {
            effects.push(Effect::Send {
                target: peer_id.to_string(),
                rpc: RpcEnvelope::player_disconnected(info.clone(), disconnect_type, reason),
            });
        }

        let primary = session.as_ref().and_then(|peer| peer.network_id);
        match self.disconnect_policy {
            DisconnectPolicy::DestroyOwned => {
                let mut doomed = self.directory.owned_by(peer_id);
                if let Some(id) = primary {
                    if !doomed.contains(&id) {
                        doomed.push(id);
                    }
                }
                for network_id in doomed {
                    self.remove_entity(network_id, &mut effects);
                }
            }
            DisconnectPolicy::ReleaseAuthority => {
                let released = self.directory.release_peer(peer_id);
                debug!("Released {} entities held by {}", released.len(), peer_id);
                if let Some(id) = primary {
                    self.directory.uncache(id, RpcKind::PlayerConnected);
                }
            }
        }

        if session.is_some() {
            let notice = RpcEnvelope::player_disconnected(info.clone(), disconnect_type, reason);
            self.broadcast(&notice, None, &mut effects);
            self.host.on_player_disconnected(&info, disconnect_type, reason);
        }

        effects.push(Effect::Disconnected {
            peer_id: peer_id.to_string(),
        });
        effects
    }

    /// Kicks every authorized peer
    pub fn disconnect_all(&mut self, reason: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        for peer_id in self.peers.authorized_ids() {
            effects.extend(self.disconnect_peer(&peer_id, DisconnectType::Kick, reason));
        }
        effects
    }

    fn check_authority(&self, origin: Option<&str>, network_id: i32) -> Result<(), NetError> {
        if self.directory.has_authority(network_id, origin) {
            return Ok(());
        }
        Err(NetError::AuthorityDenied {
            peer: origin.unwrap_or(SERVER_ID).to_string(),
            network_id,
        })
    }

    fn remove_entity(&mut self, network_id: i32, effects: &mut Vec<Effect>) {
        let Some(record) = self.directory.remove(network_id) else {
            return;
        };
        if let Some(handle) = record.handle {
            self.host.destroy(handle);
        }
        // Only the primary entity's session points at it
        for peer_id in self.peers.session_ids() {
            if let Some(peer) = self.peers.session_mut(&peer_id) {
                if peer.network_id == Some(network_id) {
                    peer.network_id = None;
                }
            }
        }
        self.broadcast(&RpcEnvelope::destroy(network_id), None, effects);
    }

    fn broadcast(&self, rpc: &RpcEnvelope, except: Option<&str>, effects: &mut Vec<Effect>) {
        for target in self.peers.session_ids() {
            if Some(target.as_str()) == except {
                continue;
            }
            effects.push(Effect::Send {
                target,
                rpc: rpc.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::host::HeadlessHost;
    use shared::rpc::Transform;
    use assert_approx_eq::assert_approx_eq;
    use tokio_test::{assert_err, assert_ok};

    fn dispatcher(config: ServerConfig) -> RpcDispatcher<HeadlessHost> {
        RpcDispatcher::with_directory(&config, HeadlessHost::new(), Directory::with_seed(11))
    }

    fn join(dispatcher: &mut RpcDispatcher<HeadlessHost>, peer: &str) -> Vec<Effect> {
        dispatcher.peers_mut().authenticate(peer, "", true);
        dispatcher.handshake(peer, peer)
    }

    fn sent_to<'a>(effects: &'a [Effect], peer: &str) -> Vec<&'a RpcEnvelope> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send { target, rpc } if target == peer => Some(rpc),
                _ => None,
            })
            .collect()
    }

    fn player_id(dispatcher: &RpcDispatcher<HeadlessHost>, peer: &str) -> i32 {
        dispatcher.peers().session(peer).unwrap().network_id.unwrap()
    }

    #[test]
    fn test_handshake_spawns_player_with_authority() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        let effects = join(&mut dispatcher, "alice");
        let id = player_id(&dispatcher, "alice");

        let to_alice = sent_to(&effects, "alice");
        assert_eq!(to_alice[0], &RpcEnvelope::spawn(id, 0, true));
        assert_eq!(
            to_alice[1].body,
            RpcBody::Authorization(AuthorityFlags {
                local_set: true,
                server_set: false,
                local_authority_set: true,
            })
        );
        assert_eq!(to_alice[2].kind(), RpcKind::PlayerConnected);
        assert_eq!(to_alice[2].network_id, id);

        assert!(dispatcher.directory().has_authority(id, Some("alice")));
        assert_eq!(dispatcher.host().entity_count(), 1);
        assert_eq!(dispatcher.host().players().count(), 1);
    }

    #[test]
    fn test_late_joiner_gets_replay_without_authority() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        let alice_id = player_id(&dispatcher, "alice");
        dispatcher
            .handle_rpc(
                "alice",
                RpcEnvelope::transform(alice_id, Transform::at([3.0, 4.0, 0.0])),
            )
            .unwrap();
        let handle = dispatcher.directory().get(alice_id).unwrap().handle.unwrap();
        let position = dispatcher.host().entity(handle).unwrap().transform.position;
        assert_approx_eq!(position[0], 3.0);
        assert_approx_eq!(position[1], 4.0);

        let effects = join(&mut dispatcher, "bob");
        let to_bob = sent_to(&effects, "bob");

        let replayed_spawn = to_bob
            .iter()
            .find(|rpc| rpc.network_id == alice_id && rpc.kind() == RpcKind::Spawn)
            .expect("alice's entity replayed");
        assert_eq!(
            replayed_spawn.body,
            RpcBody::Spawn {
                prefab_index: 0,
                request_authority: false
            }
        );

        let replayed: Vec<RpcKind> = to_bob
            .iter()
            .filter(|rpc| rpc.network_id == alice_id)
            .map(|rpc| rpc.kind())
            .collect();
        assert_eq!(
            replayed,
            vec![
                RpcKind::Spawn,
                RpcKind::Authorization,
                RpcKind::PlayerConnected,
                RpcKind::Transform
            ]
        );
    }

    #[test]
    fn test_transform_from_non_authority_is_dropped() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");
        let alice_id = player_id(&dispatcher, "alice");

        let result = dispatcher.handle_rpc(
            "bob",
            RpcEnvelope::transform(alice_id, Transform::at([9.0, 9.0, 9.0])),
        );

        assert!(matches!(result, Err(NetError::AuthorityDenied { .. })));
        let record = dispatcher.directory().get(alice_id).unwrap();
        assert!(record.cached(RpcKind::Transform).is_none());
        let handle = record.handle.unwrap();
        assert_eq!(
            dispatcher.host().entity(handle).unwrap().transform,
            Transform::at([0.0; 3])
        );
    }

    #[test]
    fn test_transform_rebroadcast_excludes_sender() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");
        join(&mut dispatcher, "carol");
        let alice_id = player_id(&dispatcher, "alice");

        let effects = dispatcher
            .handle_rpc(
                "alice",
                RpcEnvelope::transform(alice_id, Transform::at([1.0, 0.0, 0.0])),
            )
            .unwrap();

        assert!(sent_to(&effects, "alice").is_empty());
        assert_eq!(sent_to(&effects, "bob").len(), 1);
        assert_eq!(sent_to(&effects, "carol").len(), 1);
    }

    #[test]
    fn test_out_of_order_transforms_last_processed_wins() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        let id = player_id(&dispatcher, "alice");

        for x in [2.0, 1.0] {
            dispatcher
                .handle_rpc("alice", RpcEnvelope::transform(id, Transform::at([x, 0.0, 0.0])))
                .unwrap();
        }

        let cached = dispatcher
            .directory()
            .get(id)
            .unwrap()
            .cached(RpcKind::Transform)
            .unwrap();
        assert_eq!(cached.body, RpcBody::Transform(Transform::at([1.0, 0.0, 0.0])));
    }

    #[test]
    fn test_unknown_entity_is_dropped_silently() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");

        let update =
            dispatcher.handle_rpc("alice", RpcEnvelope::transform(-5, Transform::default()));
        assert_eq!(update.unwrap(), Vec::new());
        let destroy = dispatcher.handle_rpc("alice", RpcEnvelope::destroy(-5));
        assert_eq!(destroy.unwrap(), Vec::new());
    }

    #[test]
    fn test_destroy_requires_authority() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");
        let alice_id = player_id(&dispatcher, "alice");

        assert_err!(dispatcher.handle_rpc("bob", RpcEnvelope::destroy(alice_id)));
        assert!(dispatcher.directory().contains(alice_id));

        let effects = assert_ok!(dispatcher.handle_rpc("alice", RpcEnvelope::destroy(alice_id)));
        assert!(!dispatcher.directory().contains(alice_id));
        assert_eq!(sent_to(&effects, "bob"), vec![&RpcEnvelope::destroy(alice_id)]);
        assert_eq!(sent_to(&effects, "alice"), vec![&RpcEnvelope::destroy(alice_id)]);
        assert!(dispatcher.peers().session("alice").unwrap().network_id.is_none());
    }

    #[test]
    fn test_client_spawn_without_authority_request() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");

        let effects = dispatcher
            .handle_rpc("bob", RpcEnvelope::spawn_request(5, false))
            .unwrap();
        let to_bob = sent_to(&effects, "bob");
        let id = to_bob[0].network_id;

        assert_eq!(to_bob[0], &RpcEnvelope::spawn(id, 5, false));
        assert!(!dispatcher.directory().has_authority(id, Some("bob")));
        assert_eq!(sent_to(&effects, "alice"), vec![&RpcEnvelope::spawn(id, 5, false)]);
    }

    #[test]
    fn test_scene_prefab_cannot_be_requested() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        let before = dispatcher.directory().len();

        assert_err!(dispatcher.handle_rpc("alice", RpcEnvelope::spawn_request(SCENE_PREFAB, true)));
        assert_eq!(dispatcher.directory().len(), before);
    }

    #[test]
    fn test_duplicate_player_spawn_ignored() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");

        let effects = dispatcher
            .handle_rpc("alice", RpcEnvelope::spawn_request(0, true))
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(dispatcher.directory().len(), 1);
    }

    #[test]
    fn test_client_cannot_send_authorization() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        let id = player_id(&dispatcher, "alice");

        let result = dispatcher.handle_rpc(
            "alice",
            RpcEnvelope::authorization(id, AuthorityFlags::default()),
        );
        assert!(matches!(result, Err(NetError::Unauthorized(_))));
    }

    #[test]
    fn test_rpc_without_session_is_unauthorized() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        dispatcher.peers_mut().authenticate("alice", "", true);

        let result = dispatcher.handle_rpc("alice", RpcEnvelope::spawn_request(3, false));
        assert!(matches!(result, Err(NetError::Unauthorized(_))));
    }

    #[test]
    fn test_self_leave_destroys_owned_entities() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");
        let alice_id = player_id(&dispatcher, "alice");
        let info = dispatcher.peers().session("alice").unwrap().player_info();

        let effects = dispatcher
            .handle_rpc(
                "alice",
                RpcEnvelope::player_disconnected(info, DisconnectType::Request, "bye"),
            )
            .unwrap();

        let to_bob = sent_to(&effects, "bob");
        assert_eq!(to_bob[0], &RpcEnvelope::destroy(alice_id));
        assert_eq!(to_bob[1].kind(), RpcKind::PlayerDisconnected);
        assert!(sent_to(&effects, "alice").is_empty());
        assert_eq!(
            effects.last(),
            Some(&Effect::Disconnected {
                peer_id: "alice".to_string()
            })
        );
        assert!(!dispatcher.directory().contains(alice_id));
        assert!(!dispatcher.peers().is_authorized("alice"));
        assert_eq!(dispatcher.host().players().count(), 1);
    }

    #[test]
    fn test_kick_notifies_peer_first() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");

        let effects = dispatcher.disconnect_peer("bob", DisconnectType::Kick, "Lost Connection");
        match &effects[0] {
            Effect::Send { target, rpc } => {
                assert_eq!(target, "bob");
                match &rpc.body {
                    RpcBody::PlayerDisconnected {
                        disconnect_type,
                        reason,
                        ..
                    } => {
                        assert_eq!(*disconnect_type, DisconnectType::Kick);
                        assert_eq!(reason, "Lost Connection");
                    }
                    other => panic!("unexpected body {:?}", other),
                }
            }
            other => panic!("unexpected effect {:?}", other),
        }
        assert!(dispatcher.peers().session("bob").is_none());
        assert!(dispatcher.disconnect_peer("bob", DisconnectType::Kick, "again").is_empty());
    }

    #[test]
    fn test_release_policy_keeps_entities() {
        let config = ServerConfig {
            disconnect_policy: DisconnectPolicy::ReleaseAuthority,
            ..ServerConfig::default()
        };
        let mut dispatcher = dispatcher(config);
        join(&mut dispatcher, "alice");
        let alice_id = player_id(&dispatcher, "alice");

        dispatcher.disconnect_peer("alice", DisconnectType::Kick, "Lost Connection");

        let record = dispatcher.directory().get(alice_id).unwrap();
        assert!(record.authority.is_empty());
        assert!(record.cached(RpcKind::PlayerConnected).is_none());
        assert!(dispatcher.directory().has_authority(alice_id, None));
    }

    #[test]
    fn test_player_authority_can_be_withheld() {
        let config = ServerConfig {
            grant_player_authority: false,
            ..ServerConfig::default()
        };
        let mut dispatcher = dispatcher(config);
        let effects = join(&mut dispatcher, "alice");
        let id = player_id(&dispatcher, "alice");

        assert_eq!(sent_to(&effects, "alice")[0], &RpcEnvelope::spawn(id, 0, false));
        assert!(!dispatcher.directory().has_authority(id, Some("alice")));
        assert_err!(
            dispatcher.handle_rpc("alice", RpcEnvelope::transform(id, Transform::default()))
        );
    }

    #[test]
    fn test_server_operations_always_have_authority() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        let alice_id = player_id(&dispatcher, "alice");

        let spawned = dispatcher.spawn(None, 7, false).unwrap();
        let crate_id = sent_to(&spawned, "alice")[0].network_id;
        assert_eq!(dispatcher.directory().get(crate_id).unwrap().spawner, SERVER_ID);

        let moved = dispatcher
            .update(None, RpcEnvelope::transform(alice_id, Transform::at([0.0, 1.0, 0.0])))
            .unwrap();
        assert_eq!(sent_to(&moved, "alice").len(), 1);

        dispatcher.destroy(None, crate_id).unwrap();
        assert!(!dispatcher.directory().contains(crate_id));
    }

    #[test]
    fn test_custom_rpc_reaches_host() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        let id = player_id(&dispatcher, "alice");

        dispatcher
            .handle_rpc("alice", RpcEnvelope::custom(id, 130, vec![1, 2, 3], true))
            .unwrap();

        let calls = dispatcher.host().custom_rpcs();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "alice");
        assert_eq!(calls[0].2, 130);
        assert_eq!(calls[0].3, vec![1, 2, 3]);
    }

    #[test]
    fn test_disconnect_all() {
        let mut dispatcher = dispatcher(ServerConfig::default());
        join(&mut dispatcher, "alice");
        join(&mut dispatcher, "bob");

        let effects = dispatcher.disconnect_all("Server Stopping");
        let gone: Vec<&Effect> = effects
            .iter()
            .filter(|effect| matches!(effect, Effect::Disconnected { .. }))
            .collect();
        assert_eq!(gone.len(), 2);
        assert!(dispatcher.peers().is_empty());
        assert!(dispatcher.directory().is_empty());
    }
}
