use clap::Parser;
use log::info;
use server::relay::Relay;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Forwards frames between clients and a server",
    long_about = None
)]
struct Args {
    /// Relay IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Relay port to listen on
    #[arg(short, long, default_value = "58120")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let relay = Relay::bind(addr).await?;

    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down relay");
        }
    }

    Ok(())
}
