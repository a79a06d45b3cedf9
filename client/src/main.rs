use clap::Parser;
use client::network::{Client, SessionEnd};
use log::info;
use shared::config::ClientConfig;
use shared::host::HeadlessHost;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:58120")]
    server: SocketAddr,

    /// Name shown to other players
    #[arg(short = 'n', long, default_value = "Default")]
    name: String,

    /// Password expected by the server
    #[arg(short = 'p', long, default_value = "")]
    password: String,

    /// Peer id; a random one is generated when omitted
    #[arg(long)]
    id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let peer_id = args
        .id
        .unwrap_or_else(|| format!("peer-{:08x}", rand::random::<u32>()));

    info!("Starting client...");
    info!("Connecting to: {} as {}", args.server, peer_id);

    let mut config = ClientConfig::new(args.server, peer_id);
    config.display_name = args.name;
    config.password = args.password;

    let client = Client::connect(config, HeadlessHost::new()).await?;
    let handle = client.handle();
    let mut session = tokio::spawn(client.run());

    let end = tokio::select! {
        result = &mut session => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving session...");
            handle.disconnect("Quit");
            session.await??
        }
    };

    match end {
        SessionEnd::Left => info!("Left the session"),
        SessionEnd::Kicked { reason } => info!("Kicked: {}", reason),
        SessionEnd::LostConnection => info!("Lost connection to server"),
    }

    Ok(())
}
