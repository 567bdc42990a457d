//! SFU Manager - top-level orchestration
//!
//! Owns the process-wide router and the session registry, and hands out a
//! [`PeerSession`] for every connection that joins.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cleanup::CleanupCoordinator;
use crate::config::SfuConfig;
use crate::engine::{MediaEngine, MediaRouter};
use crate::error::{Result, SfuError};
use crate::fanout::Fanout;
use crate::negotiation::PeerSession;
use crate::protocol::ServerMessage;
use crate::registry::{RegistryStats, SessionRegistry};

/// SFU Manager - shared by every connection
pub struct SfuManager {
    config: Arc<SfuConfig>,
    router: Arc<dyn MediaRouter>,
    registry: Arc<SessionRegistry>,
    fanout: Fanout,
    cleanup: CleanupCoordinator,
}

impl SfuManager {
    /// Create a manager around an existing router
    pub fn new(config: SfuConfig, router: Arc<dyn MediaRouter>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = Fanout::new(Arc::clone(&registry));
        let cleanup = CleanupCoordinator::new(Arc::clone(&registry), fanout.clone());

        info!(
            codecs = config.media_codecs.len(),
            max_peers = config.max_peers,
            "SFU Manager initialized"
        );

        Arc::new(Self {
            config: Arc::new(config),
            router,
            registry,
            fanout,
            cleanup,
        })
    }

    /// Create the process-wide router on `engine` and a manager around it
    pub async fn with_engine(config: SfuConfig, engine: &dyn MediaEngine) -> Result<Arc<Self>> {
        let router = engine.create_router(&config.media_codecs).await?;
        Ok(Self::new(config, router))
    }

    /// Admit a new peer.
    ///
    /// The returned receiver yields every message for the peer, starting with
    /// the `routerRtpCapabilities` welcome carrying the producers that exist
    /// at this instant. Later producers arrive as `newProducer`.
    pub fn join(self: &Arc<Self>) -> Result<(PeerSession, mpsc::UnboundedReceiver<ServerMessage>)> {
        let _gate = self.registry.publication();

        let max_peers = self.config.max_peers;
        if max_peers > 0 && self.registry.peer_count() >= max_peers {
            warn!(
                current_peers = self.registry.peer_count(),
                max_peers = max_peers,
                "Peer limit reached"
            );
            return Err(SfuError::Capacity(format!("room is full ({max_peers} peers)")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let peer_id = self.registry.register(tx.clone());
        let existing_producers = self.registry.producers_except(&peer_id);

        // The registry keeps the only sender once `tx` drops here, so removing
        // the peer ends the receiver.
        let welcome = ServerMessage::RouterRtpCapabilities {
            peer_id: peer_id.clone(),
            router_rtp_capabilities: self.router.rtp_capabilities(),
            existing_producers,
        };
        if tx.send(welcome).is_err() {
            warn!(peer_id = %peer_id, "Failed to queue welcome message");
        }

        info!(
            peer_id = %peer_id,
            peer_count = self.registry.peer_count(),
            "Peer joined"
        );

        Ok((PeerSession::new(peer_id, Arc::clone(self)), rx))
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    pub(crate) const fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub(crate) const fn cleanup(&self) -> &CleanupCoordinator {
        &self.cleanup
    }
}
