//! Roomcast SFU signaling core
//!
//! Session orchestration for a selective-forwarding media server. Every
//! participant negotiates one sending ("producer") and one receiving
//! ("consumer") transport, publishes audio/video producers, and subscribes to
//! the producers of everyone else. Media itself is handled by an external
//! engine reached through the traits in [`engine`].
//!
//! ## Architecture
//!
//! - **`SfuManager`**: process-wide entry point, admits peers
//! - **`PeerSession`**: per-connection negotiation state machine
//! - **`SessionRegistry`**: peers, transports, producers and consumers
//! - **`Fanout`**: delivers notifications to other peers
//! - **`CleanupCoordinator`**: cascades closures and releases departing peers
//! - **`LoopbackEngine`**: in-process media engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{LoopbackEngine, SfuConfig, SfuManager};
//!
//! let manager = SfuManager::with_engine(SfuConfig::default(), &LoopbackEngine::new()).await?;
//! let (session, mut outbound) = manager.join()?;
//!
//! session.handle_text(r#"{"action":"createProducerTransport"}"#).await;
//! while let Some(message) = outbound.recv().await {
//!     // forward message.to_json()? to the client
//! }
//! session.leave();
//! ```

mod cleanup;
mod config;
pub mod engine;
mod error;
mod fanout;
pub mod loopback;
mod manager;
mod negotiation;
pub mod params;
pub mod protocol;
mod registry;
mod types;

pub use cleanup::CleanupCoordinator;
pub use config::{ListenIp, SfuConfig, WebRtcTransportConfig};
pub use engine::{EngineError, MediaEngine, MediaRouter};
pub use error::{Result, SfuError};
pub use fanout::Fanout;
pub use loopback::LoopbackEngine;
pub use manager::SfuManager;
pub use negotiation::PeerSession;
pub use protocol::{ClientMessage, ConsumeFailure, ProducerInfo, ServerMessage};
pub use registry::{
    ConsumerRecord, PeerSnapshot, ProducerRecord, RegistryStats, SessionRegistry, TransportRecord,
};
pub use types::{
    ConsumerId, ConsumerState, MediaKind, PeerId, ProducerId, TransportId, TransportRole,
    TransportState,
};
