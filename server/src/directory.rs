//! Authority and replication directory
//!
//! Maps network ids to replicated entities, records which peers may author updates to
//! each of them, and keeps the latest RPC of every kind per entity so late joiners can be
//! brought up to date by replaying them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::host::EntityHandle;
use shared::rpc::{AuthorityFlags, RpcEnvelope, RpcKind};
use shared::PeerId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub network_id: i32,
    pub prefab_index: i32,
    /// Host-side object, if the host could instantiate the prefab
    pub handle: Option<EntityHandle>,
    /// Peer that requested the spawn; does not imply control over its lifetime
    pub spawner: PeerId,
    pub authority: HashSet<PeerId>,
    sequence: u64,
    last_rpc_by_kind: HashMap<RpcKind, RpcEnvelope>,
    cache_order: Vec<RpcKind>,
}

impl EntityRecord {
    pub fn cached(&self, kind: RpcKind) -> Option<&RpcEnvelope> {
        self.last_rpc_by_kind.get(&kind)
    }

    /// Cached RPCs in the order their kinds were first seen
    pub fn cached_rpcs(&self) -> impl Iterator<Item = &RpcEnvelope> {
        self.cache_order
            .iter()
            .filter_map(|kind| self.last_rpc_by_kind.get(kind))
    }
}

pub struct Directory {
    entities: HashMap<i32, EntityRecord>,
    rng: StdRng,
    next_sequence: u64,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic id allocation for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            entities: HashMap::new(),
            rng,
            next_sequence: 0,
        }
    }

    /// Draws a random non-negative id not used by any live entity
    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.rng.gen_range(0..i32::MAX);
            if !self.entities.contains_key(&id) {
                return id;
            }
        }
    }

    /// Creates a record under a freshly allocated id
    pub fn insert(
        &mut self,
        prefab_index: i32,
        spawner: impl Into<PeerId>,
        handle: Option<EntityHandle>,
    ) -> i32 {
        let network_id = self.allocate_id();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.entities.insert(
            network_id,
            EntityRecord {
                network_id,
                prefab_index,
                handle,
                spawner: spawner.into(),
                authority: HashSet::new(),
                sequence,
                last_rpc_by_kind: HashMap::new(),
                cache_order: Vec::new(),
            },
        );
        network_id
    }

    pub fn get(&self, network_id: i32) -> Option<&EntityRecord> {
        self.entities.get(&network_id)
    }

    pub fn get_mut(&mut self, network_id: i32) -> Option<&mut EntityRecord> {
        self.entities.get_mut(&network_id)
    }

    pub fn remove(&mut self, network_id: i32) -> Option<EntityRecord> {
        self.entities.remove(&network_id)
    }

    pub fn contains(&self, network_id: i32) -> bool {
        self.entities.contains_key(&network_id)
    }

    /// `None` stands for the server itself, which always has authority
    pub fn has_authority(&self, network_id: i32, sender: Option<&str>) -> bool {
        match (self.entities.get(&network_id), sender) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(record), Some(peer)) => record.authority.contains(peer),
        }
    }

    pub fn grant(&mut self, network_id: i32, peer: impl Into<PeerId>) -> bool {
        match self.entities.get_mut(&network_id) {
            Some(record) => record.authority.insert(peer.into()),
            None => false,
        }
    }

    pub fn revoke(&mut self, network_id: i32, peer: &str) -> bool {
        match self.entities.get_mut(&network_id) {
            Some(record) => record.authority.remove(peer),
            None => false,
        }
    }

    /// Entities `peer` holds authority over, in spawn order
    pub fn owned_by(&self, peer: &str) -> Vec<i32> {
        let mut owned: Vec<&EntityRecord> = self
            .entities
            .values()
            .filter(|record| record.authority.contains(peer))
            .collect();
        owned.sort_by_key(|record| record.sequence);
        owned.iter().map(|record| record.network_id).collect()
    }

    /// Revokes every authority entry of `peer`, returning the affected entities
    pub fn release_peer(&mut self, peer: &str) -> Vec<i32> {
        let owned = self.owned_by(peer);
        for network_id in &owned {
            self.revoke(*network_id, peer);
        }
        owned
    }

    /// Stores the RPC as the latest of its kind for its entity
    pub fn cache(&mut self, rpc: &RpcEnvelope) -> bool {
        let Some(record) = self.entities.get_mut(&rpc.network_id) else {
            return false;
        };

        let kind = rpc.kind();
        if record.last_rpc_by_kind.insert(kind, rpc.clone()).is_none() {
            record.cache_order.push(kind);
        }
        true
    }

    pub fn uncache(&mut self, network_id: i32, kind: RpcKind) -> Option<RpcEnvelope> {
        let record = self.entities.get_mut(&network_id)?;
        record.cache_order.retain(|cached| *cached != kind);
        record.last_rpc_by_kind.remove(&kind)
    }

    /// RPCs that bring `peer` up to date with every live entity
    ///
    /// Each entity is described by a Spawn without an authority request, followed by an
    /// Authorization clearing authority if `peer` holds none, then its cached RPCs.
    pub fn replay_for(&self, peer: &str, exclude: Option<i32>) -> Vec<RpcEnvelope> {
        let mut records: Vec<&EntityRecord> = self
            .entities
            .values()
            .filter(|record| Some(record.network_id) != exclude)
            .collect();
        records.sort_by_key(|record| record.sequence);

        let mut replay = Vec::new();
        for record in records {
            replay.push(RpcEnvelope::spawn(
                record.network_id,
                record.prefab_index,
                false,
            ));

            if !record.authority.contains(peer) {
                replay.push(RpcEnvelope::authorization(
                    record.network_id,
                    AuthorityFlags {
                        local_set: true,
                        server_set: false,
                        local_authority_set: false,
                    },
                ));
            }

            replay.extend(record.cached_rpcs().cloned());
        }
        replay
    }

    pub fn ids(&self) -> Vec<i32> {
        let mut records: Vec<&EntityRecord> = self.entities.values().collect();
        records.sort_by_key(|record| record.sequence);
        records.iter().map(|record| record.network_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
