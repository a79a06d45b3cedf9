//! Boundary to the engine that owns the actual scene objects
//!
//! The networking core never touches rendering, physics or input. It asks the host to
//! create and destroy entities, reads and writes their transforms, and reports lifecycle
//! events through the default-no-op callbacks.

use crate::rpc::{AuthorityFlags, DisconnectType, PlayerInfo, Transform};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type EntityHandle = u64;

/// Custom RPCs a [`HeadlessHost`] remembers; older calls are dropped first
pub const CUSTOM_RPC_LOG: usize = 256;

pub trait EntityHost: Send {
    /// Returns `None` when the prefab index is unknown to the host
    fn instantiate(&mut self, prefab_index: i32) -> Option<EntityHandle>;
    fn destroy(&mut self, handle: EntityHandle);
    fn get_transform(&self, handle: EntityHandle) -> Option<Transform>;
    fn set_transform(&mut self, handle: EntityHandle, transform: Transform);

    fn on_custom_rpc(
        &mut self,
        _handle: EntityHandle,
        _sender: &str,
        _kind: u8,
        _payload: &[u8],
    ) {
    }
    fn on_authority_changed(&mut self, _handle: EntityHandle, _flags: AuthorityFlags) {}
    fn on_player_connected(&mut self, _player: &PlayerInfo) {}
    fn on_player_disconnected(
        &mut self,
        _player: &PlayerInfo,
        _disconnect_type: DisconnectType,
        _reason: &str,
    ) {
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessEntity {
    pub prefab_index: i32,
    pub transform: Transform,
    pub authority: AuthorityFlags,
}

/// Entity table without a scene, used by the standalone binaries and in tests
#[derive(Debug, Default)]
pub struct HeadlessHost {
    next_handle: EntityHandle,
    entities: HashMap<EntityHandle, HeadlessEntity>,
    players: HashMap<String, PlayerInfo>,
    custom_rpcs: Vec<(EntityHandle, String, u8, Vec<u8>)>,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, handle: EntityHandle) -> Option<&HeadlessEntity> {
        self.entities.get(&handle)
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityHandle, &HeadlessEntity)> {
        self.entities.iter().map(|(handle, entity)| (*handle, entity))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerInfo> {
        self.players.values()
    }

    /// The most recent custom RPCs, oldest first
    pub fn custom_rpcs(&self) -> &[(EntityHandle, String, u8, Vec<u8>)] {
        &self.custom_rpcs
    }
}

impl EntityHost for HeadlessHost {
    fn instantiate(&mut self, prefab_index: i32) -> Option<EntityHandle> {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.entities.insert(
            handle,
            HeadlessEntity {
                prefab_index,
                transform: Transform::at([0.0; 3]),
                authority: AuthorityFlags::default(),
            },
        );
        Some(handle)
    }

    fn destroy(&mut self, handle: EntityHandle) {
        self.entities.remove(&handle);
    }

    fn get_transform(&self, handle: EntityHandle) -> Option<Transform> {
        self.entities.get(&handle).map(|e| e.transform)
    }

    fn set_transform(&mut self, handle: EntityHandle, transform: Transform) {
        if let Some(entity) = self.entities.get_mut(&handle) {
            entity.transform = transform;
        }
    }

    fn on_custom_rpc(&mut self, handle: EntityHandle, sender: &str, kind: u8, payload: &[u8]) {
        if self.custom_rpcs.len() >= CUSTOM_RPC_LOG {
            self.custom_rpcs.remove(0);
        }
        self.custom_rpcs
            .push((handle, sender.to_string(), kind, payload.to_vec()));
    }

    fn on_authority_changed(&mut self, handle: EntityHandle, flags: AuthorityFlags) {
        if let Some(entity) = self.entities.get_mut(&handle) {
            entity.authority = flags;
        }
    }

    fn on_player_connected(&mut self, player: &PlayerInfo) {
        self.players.insert(player.peer_id.clone(), player.clone());
    }

    fn on_player_disconnected(&mut self, player: &PlayerInfo, _: DisconnectType, _: &str) {
        self.players.remove(&player.peer_id);
    }
}

/// Lets a caller keep a view of the host while a session task drives it
impl<H: EntityHost> EntityHost for Arc<Mutex<H>> {
    fn instantiate(&mut self, prefab_index: i32) -> Option<EntityHandle> {
        lock(self).instantiate(prefab_index)
    }

    fn destroy(&mut self, handle: EntityHandle) {
        lock(self).destroy(handle)
    }

    fn get_transform(&self, handle: EntityHandle) -> Option<Transform> {
        lock(self).get_transform(handle)
    }

    fn set_transform(&mut self, handle: EntityHandle, transform: Transform) {
        lock(self).set_transform(handle, transform)
    }

    fn on_custom_rpc(&mut self, handle: EntityHandle, sender: &str, kind: u8, payload: &[u8]) {
        lock(self).on_custom_rpc(handle, sender, kind, payload)
    }

    fn on_authority_changed(&mut self, handle: EntityHandle, flags: AuthorityFlags) {
        lock(self).on_authority_changed(handle, flags)
    }

    fn on_player_connected(&mut self, player: &PlayerInfo) {
        lock(self).on_player_connected(player)
    }

    fn on_player_disconnected(
        &mut self,
        player: &PlayerInfo,
        disconnect_type: DisconnectType,
        reason: &str,
    ) {
        lock(self).on_player_disconnected(player, disconnect_type, reason)
    }
}

fn lock<H>(host: &Mutex<H>) -> std::sync::MutexGuard<'_, H> {
    // A panicked holder leaves the entity table usable
    host.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
