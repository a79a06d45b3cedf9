use clap::Parser;
use log::info;
use server::network::Server;
use shared::config::{DisconnectPolicy, HeartbeatConfig, ReliabilityConfig, ServerConfig};
use shared::host::HeadlessHost;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "58120")]
    port: u16,

    /// Password required to join; empty disables the check
    #[arg(long, default_value = "")]
    password: String,

    /// Maximum number of peers, 0 for unlimited
    #[arg(short, long, default_value = "0")]
    max_peers: usize,

    /// Peer id to ban at startup, as id or id=reason (repeatable)
    #[arg(long = "ban")]
    bans: Vec<String>,

    /// Reach clients through a relay at this address instead of listening
    #[arg(long)]
    proxy: Option<SocketAddr>,

    /// Keep a departing peer's entities and only release its authority
    #[arg(long)]
    keep_entities: bool,

    /// Do not give peers authority over their own player entity
    #[arg(long)]
    no_player_authority: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Seconds before an unacknowledged important frame is resent
    #[arg(long, default_value = "2")]
    retry_after: u64,
}

fn parse_bans(bans: &[String]) -> HashMap<String, String> {
    bans.iter()
        .map(|entry| match entry.split_once('=') {
            Some((id, reason)) => (id.to_string(), reason.to_string()),
            None => (entry.clone(), "Banned".to_string()),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let config = ServerConfig {
        listen_addr,
        password: args.password,
        max_peers: args.max_peers,
        banned: parse_bans(&args.bans),
        proxy_addr: args.proxy,
        grant_player_authority: !args.no_player_authority,
        disconnect_policy: if args.keep_entities {
            DisconnectPolicy::ReleaseAuthority
        } else {
            DisconnectPolicy::DestroyOwned
        },
        reliability: ReliabilityConfig {
            retry_after: Duration::from_secs(args.retry_after),
            ..ReliabilityConfig::default()
        },
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(args.heartbeat_ms),
            ..HeartbeatConfig::default()
        },
        ..ServerConfig::default()
    };

    info!("Starting server...");
    if config.max_peers > 0 {
        info!("Accepting up to {} peers", config.max_peers);
    }

    let server = Server::new(config, HeadlessHost::new()).await?;
    let handle = server.handle();
    let mut session = tokio::spawn(server.run());

    tokio::select! {
        result = &mut session => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.stop();
            session.await??;
        }
    }

    Ok(())
}
