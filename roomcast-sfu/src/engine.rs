//! Capability client for the external media engine
//!
//! The signaling core never touches media. Everything it needs from the
//! engine (router capabilities, the compatibility check, transport, producer
//! and consumer factories, close notifications) goes through these traits.
//! [`crate::loopback`] provides an in-process implementation.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::WebRtcTransportConfig;
use crate::params::{
    DtlsParameters, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportParameters,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// Errors reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unknown producer: {0}")]
    UnknownProducer(ProducerId),

    #[error("unsupported parameters: {0}")]
    Unsupported(String),

    #[error("transport {0} is closed")]
    TransportClosed(TransportId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("engine failure: {0}")]
    Internal(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Why a consumer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on the consumer itself
    Local,
    /// The source producer went away
    ProducerClosed,
    /// The transport carrying the consumer was closed
    TransportClosed,
}

/// Entry point of the media engine; creates routers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>>;
}

/// Process-wide router: capabilities, compatibility check and transport factory
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether `producer_id` can be delivered to a receiver with `rtp_capabilities`
    async fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportConfig,
    ) -> EngineResult<Arc<dyn EngineTransport>>;
}

/// One negotiated WebRTC transport
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> EngineResult<Arc<dyn EngineConsumer>>;

    /// Close the transport and everything bound to it. Idempotent.
    fn close(&self);
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Close the producer; its consumers observe [`CloseReason::ProducerClosed`]. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Consumers start paused until the subscriber resumes them
    fn paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;

    /// Idempotent.
    fn close(&self);

    /// Close notification. Holds `None` while the consumer is alive and the
    /// reason once it has been closed, from whichever side.
    fn closed(&self) -> watch::Receiver<Option<CloseReason>>;
}
