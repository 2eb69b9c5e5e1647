use clap::Parser;
use log::info;
use relay::network::Relay;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Room relay for peer-hosted arena matches", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of peers in the room
    #[arg(short, long, default_value = "16")]
    capacity: usize,

    /// Seconds of silence before a peer is dropped
    #[arg(short, long, default_value_t = shared::PEER_TIMEOUT_SECS)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    let mut relay = Relay::new(&address, args.capacity, Duration::from_secs(args.timeout)).await?;

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
