//! Peer admission and session bookkeeping for the accepting side
//!
//! This module tracks every remote endpoint the server knows about:
//! - The authorized set: peers that passed authentication
//! - Sessions: peers that also completed the handshake and have a display name
//! - The ban list, with the reason reported back to banned peers
//!
//! Authentication is evaluated here, in a fixed order, and turned into the
//! `Authentication` response that goes back on the wire. Frames from peers outside the
//! authorized set are dropped by the session loop before they reach any handler.

use log::{debug, info};
use shared::config::ServerConfig;
use shared::frame::{AuthResponse, Authentication};
use shared::rpc::PlayerInfo;
use shared::PeerId;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Message sent with `Error` while the relay has not answered yet
pub const PROXY_NOT_READY: &str = "server_error_proxy";

/// A peer that completed the handshake
#[derive(Debug, Clone)]
pub struct Peer {
    /// Identifier supplied by the peer, stable across address changes
    pub peer_id: PeerId,
    /// Name announced in the handshake
    pub display_name: String,
    /// Primary replicated entity, once spawned
    pub network_id: Option<i32>,
    /// When the handshake arrived
    pub connected_at: Instant,
}

impl Peer {
    /// Creates a session without a primary entity
    pub fn new(peer_id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            network_id: None,
            connected_at: Instant::now(),
        }
    }

    /// Public description used by the player lifecycle RPCs
    ///
    /// Peers without a primary entity are described with the unassigned id so the
    /// disconnect notice can still be sent for them.
    pub fn player_info(&self) -> PlayerInfo {
        PlayerInfo {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            network_id: self.network_id.unwrap_or(shared::rpc::UNASSIGNED_NETWORK_ID),
        }
    }
}

/// Authorized peers, their sessions and the ban list
pub struct PeerManager {
    authorized: HashSet<PeerId>,
    sessions: HashMap<PeerId, Peer>,
    banned: HashMap<PeerId, String>,
    /// Empty disables the password check
    password: String,
    /// Zero means unlimited
    max_peers: usize,
}

impl PeerManager {
    /// Creates an empty peer table with the configured password, capacity and bans
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            authorized: HashSet::new(),
            sessions: HashMap::new(),
            banned: config.banned.clone(),
            password: config.password.clone(),
            max_peers: config.max_peers,
        }
    }

    /// Evaluates an authentication attempt and authorizes the peer on success
    ///
    /// Checks run in this order: password, relay readiness, ban list, capacity. A peer
    /// that is already authorized gets `Connected` again without counting against the
    /// capacity, so a dial retry whose first answer was lost is not turned away.
    pub fn authenticate(
        &mut self,
        peer_id: &str,
        password: &str,
        proxy_ready: bool,
    ) -> Authentication {
        if !self.password.is_empty() && password != self.password {
            debug!("{} supplied an incorrect password", peer_id);
            return Authentication::response(AuthResponse::IncorrectPassword, "Incorrect password");
        }

        if !proxy_ready {
            return Authentication::response(AuthResponse::Error, PROXY_NOT_READY);
        }

        if let Some(reason) = self.banned.get(peer_id) {
            debug!("Rejecting banned peer {}", peer_id);
            return Authentication::response(AuthResponse::Banned, reason.clone());
        }

        if self.authorized.contains(peer_id) {
            return Authentication::response(AuthResponse::Connected, "");
        }

        if self.max_peers > 0 && self.authorized.len() >= self.max_peers {
            debug!("Rejecting {}: lobby full", peer_id);
            return Authentication::response(AuthResponse::LobbyFull, "Lobby is full");
        }

        self.authorized.insert(peer_id.to_string());
        info!("{} authenticated", peer_id);
        Authentication::response(AuthResponse::Connected, "")
    }

    /// Returns true if the peer passed authentication
    pub fn is_authorized(&self, peer_id: &str) -> bool {
        self.authorized.contains(peer_id)
    }

    /// Creates the session for an authorized peer
    ///
    /// Returns false if the peer is not authorized or already has a session, which makes
    /// duplicate handshakes harmless.
    pub fn add_session(&mut self, peer_id: &str, display_name: &str) -> bool {
        if !self.authorized.contains(peer_id) || self.sessions.contains_key(peer_id) {
            return false;
        }

        info!("{} joined as \"{}\"", peer_id, display_name);
        self.sessions
            .insert(peer_id.to_string(), Peer::new(peer_id, display_name));
        true
    }

    pub fn session(&self, peer_id: &str) -> Option<&Peer> {
        self.sessions.get(peer_id)
    }

    pub fn session_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.sessions.get_mut(peer_id)
    }

    /// Records the peer's primary entity
    pub fn set_network_id(&mut self, peer_id: &str, network_id: i32) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(peer) => {
                peer.network_id = Some(network_id);
                true
            }
            None => false,
        }
    }

    /// Removes the peer from the authorized set and drops its session
    ///
    /// Returns the session if there was one. Peers that authenticated but never sent a
    /// handshake only leave the authorized set.
    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        self.authorized.remove(peer_id);
        self.sessions.remove(peer_id)
    }

    /// Adds a peer to the ban list; future authentication attempts are rejected
    pub fn ban(&mut self, peer_id: impl Into<PeerId>, reason: impl Into<String>) {
        let peer_id = peer_id.into();
        info!("Banned {}", peer_id);
        self.banned.insert(peer_id, reason.into());
    }

    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.banned.contains_key(peer_id)
    }

    /// Ids of all peers with a session, sorted for stable fan-out order
    pub fn session_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of all authorized peers, with or without a session
    pub fn authorized_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.authorized.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn authorized_count(&self) -> usize {
        self.authorized.len()
    }

    /// Returns the number of peers with a session
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
