mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use roomcast_sfu::{LoopbackEngine, SfuManager};

use server::RoomcastServer;

#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(about = "Roomcast SFU signaling server", long_about = None)]
struct Args {
    /// Config file (YAML or TOML)
    #[arg(long, short = 'c', env = "ROOMCAST_CONFIG_PATH")]
    config: Option<String>,

    /// HTTP listen host, overrides server.host
    #[arg(long)]
    host: Option<String>,

    /// HTTP listen port, overrides server.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Starting roomcast v{}", env!("CARGO_PKG_VERSION"));

    // 3. Create the router on the media engine
    let sfu = SfuManager::with_engine(config.sfu.clone(), &LoopbackEngine::new()).await?;
    info!(
        listen_ips = config.sfu.webrtc_transport.listen_ips.len(),
        max_peers = config.sfu.max_peers,
        "Media router created"
    );

    // 4. Serve until shutdown
    RoomcastServer::new(config, sfu).start().await
}
