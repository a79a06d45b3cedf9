//! # Session Client Library
//!
//! Dialing side of the transport. A client authenticates against the server, announces
//! itself with a handshake and from then on mirrors the entities and players the server
//! replicates to it.
//!
//! ## Connection Lifecycle
//!
//! `Disconnected -> Connecting -> Authenticating -> Established`. Authentication is
//! retried every 2.5 seconds, five times at most. A rejection (wrong password, ban, full
//! lobby, relay not ready) ends the session with the matching error; silence ends it with
//! `ConnectionFailed`.
//!
//! Once established, heartbeats and pings go out every second. Three silent heartbeat
//! intervals, or an important frame the server never acknowledges, end the session as
//! `LostConnection`.
//!
//! ## Module Organization
//!
//! - `connection`: the dialer state machine and its retry budget
//! - `replica`: local mirror of replicated entities and the player roster
//! - `network`: the session loop and the [`network::ClientHandle`] used to drive it
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, SessionEnd};
//! use shared::config::ClientConfig;
//! use shared::host::HeadlessHost;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ClientConfig::new("127.0.0.1:58120".parse()?, "peer-1");
//!     config.display_name = "Ada".to_string();
//!
//!     let client = Client::connect(config, HeadlessHost::new()).await?;
//!     let handle = client.handle();
//!     let session = tokio::spawn(client.run());
//!
//!     if handle.established().await {
//!         // Server-side spawn; the network id arrives with the replicated entity
//!         handle.spawn(3, true);
//!     }
//!
//!     handle.disconnect("Quit");
//!     assert_eq!(session.await??, SessionEnd::Left);
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod network;
pub mod replica;
