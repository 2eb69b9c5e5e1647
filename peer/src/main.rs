use clap::Parser;
use log::info;
use peer::network::Client;
use peer::Peer;
use shared::GameConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Arena peer", long_about = None)]
struct Args {
    /// Relay address to join
    #[arg(short = 'r', long, default_value = "127.0.0.1:8080")]
    relay: String,

    /// Display name announced to the room
    #[arg(short, long, default_value = "player")]
    name: String,

    /// Gameplay tuning file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Update loop rate in ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Play alone without contacting the relay
    #[arg(long)]
    offline: bool,

    /// Do not rejoin the relay after losing it
    #[arg(long)]
    no_reconnect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = GameConfig::load(args.config.as_deref())?;

    info!("Starting peer {}...", args.name);
    info!(
        "Capacity {} actors, damage window {:.1}s, {}% fragment damage",
        config.bot_capacity, config.damage_window_secs, config.damage_percent
    );

    let peer = Peer::new(&args.name, config);
    let mut client = Client::new(&args.relay, peer, args.tick_rate, !args.no_reconnect).await?;

    if args.offline {
        info!("Running offline");
        client.start_offline();
    } else {
        info!("Joining relay at {}", args.relay);
    }

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving");
        }
    }
    client.leave().await;

    Ok(())
}
