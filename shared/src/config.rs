//! Configuration value objects, built once at startup and handed to the session objects

use crate::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Prefab index that designates a peer's primary entity
pub const PLAYER_PREFAB: i32 = 0;
/// Prefab index reserved for entities that already exist in the scene
pub const SCENE_PREFAB: i32 = -1;

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// How often pending important frames are inspected
    pub sweep_interval: Duration,
    /// How long a frame waits for its acknowledgement before being resent
    pub retry_after: Duration,
    /// Resends after the first transmission before the target is declared unreachable
    pub max_retries: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            retry_after: Duration::from_secs(2),
            max_retries: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Consecutive silent intervals after which the peer is dropped
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            miss_threshold: 3,
        }
    }
}

/// What happens to the entities a departing peer holds authority over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    #[default]
    DestroyOwned,
    ReleaseAuthority,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Empty disables the password check
    pub password: String,
    /// Zero means unlimited
    pub max_peers: usize,
    /// Banned peer ids and the reason reported to them
    pub banned: HashMap<PeerId, String>,
    /// Reach clients through a relay at this address instead of listening directly
    pub proxy_addr: Option<SocketAddr>,
    pub proxy_retry_interval: Duration,
    pub proxy_attempts: u32,
    pub player_prefab: i32,
    pub spawn_player_on_handshake: bool,
    pub grant_player_authority: bool,
    pub disconnect_policy: DisconnectPolicy,
    pub reliability: ReliabilityConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 58120)),
            password: String::new(),
            max_peers: 0,
            banned: HashMap::new(),
            proxy_addr: None,
            proxy_retry_interval: Duration::from_millis(2500),
            proxy_attempts: 5,
            player_prefab: PLAYER_PREFAB,
            spawn_player_on_handshake: true,
            grant_player_authority: true,
            disconnect_policy: DisconnectPolicy::default(),
            reliability: ReliabilityConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub peer_id: PeerId,
    pub display_name: String,
    pub password: String,
    pub connect_retry_interval: Duration,
    pub connect_attempts: u32,
    pub ping_interval: Duration,
    pub reliability: ReliabilityConfig,
    pub heartbeat: HeartbeatConfig,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr, peer_id: impl Into<PeerId>) -> Self {
        Self {
            server_addr,
            peer_id: peer_id.into(),
            display_name: "Default".to_string(),
            password: String::new(),
            connect_retry_interval: Duration::from_millis(2500),
            connect_attempts: 5,
            ping_interval: Duration::from_secs(1),
            reliability: ReliabilityConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}
