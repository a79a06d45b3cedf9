//! # Session Server Library
//!
//! Accepting side of the transport. The server admits peers, keeps the authoritative
//! directory of replicated entities, and decides who may change what.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Every peer authenticates before anything else it sends is looked at. Authentication
//! checks the password, relay readiness, the ban list and capacity, in that order, and
//! answers with a typed response. Frames of any other type from unauthorized peers are
//! dropped without a reply.
//!
//! ### Replication
//! Entities are spawned under server-assigned random network ids. Each entity carries
//! the set of peers allowed to update it, and the latest RPC of each kind so a peer
//! joining late is brought up to date by replaying those.
//!
//! ### Liveness
//! Heartbeats go out to every authorized peer on a fixed interval. Peers that stay silent
//! for three intervals, or stop acknowledging important frames, are disconnected with
//! reason "Lost Connection".
//!
//! ## Module Organization
//!
//! - `peer_manager`: authorized set, sessions, ban list and the authentication decision
//! - `directory`: network id allocation, authority sets and the per-entity RPC cache
//! - `dispatcher`: RPC handling over the peer table and directory, returning effects
//! - `network`: the session loop tying the transport, heartbeats and dispatcher together
//! - `relay`: standalone frame relay for servers reached through a proxy
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::config::ServerConfig;
//! use shared::host::HeadlessHost;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         password: "hunter2".to_string(),
//!         max_peers: 16,
//!         ..ServerConfig::default()
//!     };
//!
//!     let server = Server::new(config, HeadlessHost::new()).await?;
//!     let handle = server.handle();
//!
//!     // Runs until handle.stop() kicks every peer with "Server Stopping"
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.stop();
//!     });
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Internally the session loop runs alongside the transport's receive, send and
//! reliability sweep tasks and a heartbeat task. Only the session loop touches the peer
//! table and the directory.

pub mod directory;
pub mod dispatcher;
pub mod network;
pub mod peer_manager;
pub mod relay;
