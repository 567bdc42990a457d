//! Server lifecycle management
//!
//! Binds the HTTP listener, serves the signaling routes and shuts down
//! gracefully on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use roomcast_sfu::SfuManager;

use crate::config::Config;

/// Roomcast server
pub struct RoomcastServer {
    config: Config,
    sfu: Arc<SfuManager>,
}

impl RoomcastServer {
    pub const fn new(config: Config, sfu: Arc<SfuManager>) -> Self {
        Self { config, sfu }
    }

    /// Serve until a shutdown signal arrives
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        let router = roomcast_api::create_router(Arc::clone(&self.sfu), self.config.server.max_message_size);

        info!("HTTP server listening on {}", http_addr);
        info!("Signaling endpoint: ws://{}/ws", http_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let stats = self.sfu.stats();
        info!(
            peers = stats.peers,
            producers = stats.producers,
            consumers = stats.consumers,
            "HTTP server shut down gracefully"
        );
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
