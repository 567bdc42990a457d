//! In-process media engine
//!
//! `LoopbackEngine` implements the capability traits without moving any
//! media: it allocates identifiers, fabricates ICE/DTLS parameters from the
//! configured listen addresses, checks codec compatibility, and propagates
//! close events the same way a real engine would (closing a producer closes
//! its consumers, closing a transport closes everything bound to it).

use async_trait::async_trait;
use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

use crate::config::WebRtcTransportConfig;
use crate::engine::{
    CloseReason, EngineConsumer, EngineError, EngineProducer, EngineResult, EngineTransport,
    MediaEngine, MediaRouter,
};
use crate::params::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters, TransportParameters,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// First dynamic payload type handed to router codecs
const FIRST_PAYLOAD_TYPE: u8 = 100;

/// Retransmission codecs are negotiated alongside media codecs and never
/// decide compatibility on their own
fn is_media_codec(mime_type: &str) -> bool {
    !mime_type.to_ascii_lowercase().ends_with("/rtx")
}

/// Media engine that runs entirely inside the signaling process
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackEngine;

impl LoopbackEngine {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        Ok(Arc::new(LoopbackRouter::new(media_codecs)?))
    }
}

/// Router of the loopback engine
pub struct LoopbackRouter {
    codecs: Vec<RtpCodecCapability>,
    producers: Arc<DashMap<ProducerId, Arc<LoopbackProducer>>>,
    next_port: AtomicU16,
}

impl LoopbackRouter {
    pub fn new(media_codecs: &[RtpCodecCapability]) -> EngineResult<Self> {
        if media_codecs.is_empty() {
            return Err(EngineError::Unsupported("router needs at least one codec".to_string()));
        }

        let codecs = media_codecs
            .iter()
            .zip(FIRST_PAYLOAD_TYPE..)
            .map(|(codec, payload_type)| RtpCodecCapability {
                preferred_payload_type: codec.preferred_payload_type.or(Some(payload_type)),
                ..codec.clone()
            })
            .collect();

        Ok(Self {
            codecs,
            producers: Arc::new(DashMap::new()),
            next_port: AtomicU16::new(0),
        })
    }
}

/// Codecs of `producer` that the receiver declared support for, rewritten
/// with the receiver's payload types
fn negotiate_codecs(
    producer: &LoopbackProducer,
    rtp_capabilities: &RtpCapabilities,
) -> Vec<RtpCodecParameters> {
    producer
        .rtp_parameters
        .codecs
        .iter()
        .filter(|codec| is_media_codec(&codec.mime_type))
        .filter_map(|codec| {
            rtp_capabilities
                .codecs
                .iter()
                .find(|cap| {
                    cap.kind == producer.kind
                        && cap.matches(&codec.mime_type, codec.clock_rate, codec.channels)
                })
                .map(|cap| RtpCodecParameters {
                    payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                    ..codec.clone()
                })
        })
        .collect()
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.codecs.clone(),
            header_extensions: Vec::new(),
        }
    }

    async fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producers.get(producer_id).map(|p| Arc::clone(p.value())) else {
            debug!(producer_id = %producer_id, "can_consume: unknown producer");
            return false;
        };
        !negotiate_codecs(&producer, rtp_capabilities).is_empty()
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportConfig,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        if options.listen_ips.is_empty() {
            return Err(EngineError::Unsupported("no listen ips configured".to_string()));
        }

        let offset = self.next_port.fetch_add(1, Ordering::Relaxed);
        let port = options.rtc_min_port.wrapping_add(offset);
        let parameters = fabricate_parameters(options, port);
        let transport = LoopbackTransport {
            id: TransportId::generate(),
            parameters,
            router_codecs: self.codecs.clone(),
            producers: Arc::clone(&self.producers),
            state: Mutex::new(TransportInner::default()),
        };

        debug!(transport_id = %transport.id, port, "Loopback transport created");
        Ok(Arc::new(transport))
    }
}

fn fabricate_parameters(options: &WebRtcTransportConfig, port: u16) -> TransportParameters {
    let mut ice_candidates = Vec::new();
    for (index, listen_ip) in options.listen_ips.iter().enumerate() {
        let base = u32::try_from(index).unwrap_or(u32::MAX);
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: format!("udpcandidate{index}"),
                priority: (if options.prefer_udp { 1_076_302_079 } else { 1_076_302_078 }) - base,
                ip: listen_ip.advertised().to_string(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: format!("tcpcandidate{index}"),
                priority: (if options.prefer_udp { 1_076_276_479 } else { 1_076_302_079 }) - base,
                ip: listen_ip.advertised().to_string(),
                protocol: "tcp".to_string(),
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }
    }

    let fingerprint = uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .chain(uuid::Uuid::new_v4().as_bytes())
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    TransportParameters {
        ice_parameters: IceParameters {
            username_fragment: nanoid!(16),
            password: nanoid!(32),
            ice_lite: true,
        },
        ice_candidates,
        dtls_parameters: DtlsParameters {
            role: Some("auto".to_string()),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint,
            }],
        },
    }
}

#[derive(Default)]
struct TransportInner {
    connected: bool,
    closed: bool,
    producers: Vec<Arc<LoopbackProducer>>,
    consumers: Vec<Arc<LoopbackConsumer>>,
}

pub struct LoopbackTransport {
    id: TransportId,
    parameters: TransportParameters,
    router_codecs: Vec<RtpCodecCapability>,
    producers: Arc<DashMap<ProducerId, Arc<LoopbackProducer>>>,
    state: Mutex<TransportInner>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.state.lock().closed {
            Err(EngineError::TransportClosed(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Unsupported("missing DTLS fingerprints".to_string()));
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::TransportClosed(self.id.clone()));
        }
        if state.connected {
            return Err(EngineError::InvalidState("connect() already called".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        self.ensure_open()?;

        let media_codecs: Vec<_> = rtp_parameters
            .codecs
            .iter()
            .filter(|codec| is_media_codec(&codec.mime_type))
            .collect();
        if media_codecs.is_empty() {
            return Err(EngineError::Unsupported("rtpParameters carry no media codec".to_string()));
        }
        for codec in media_codecs {
            let supported = self
                .router_codecs
                .iter()
                .any(|cap| cap.kind == kind && cap.matches(&codec.mime_type, codec.clock_rate, codec.channels));
            if !supported {
                return Err(EngineError::Unsupported(format!(
                    "{} codec {} is not enabled on the router",
                    kind, codec.mime_type
                )));
            }
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            router_producers: Arc::downgrade(&self.producers),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::TransportClosed(self.id.clone()));
            }
            state.producers.push(Arc::clone(&producer));
        }
        self.producers.insert(producer.id.clone(), Arc::clone(&producer));

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        self.ensure_open()?;

        let producer = self
            .producers
            .get(producer_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;

        let codecs = negotiate_codecs(&producer, rtp_capabilities);
        if codecs.is_empty() {
            return Err(EngineError::Unsupported(format!(
                "receiver cannot decode producer {producer_id}"
            )));
        }

        let (closed_tx, _) = watch::channel(None);
        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::generate(),
            rtp_parameters: RtpParameters {
                mid: None,
                codecs,
                extra: producer.rtp_parameters.extra.clone(),
            },
            paused: AtomicBool::new(true),
            closed_tx,
        });

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::TransportClosed(self.id.clone()));
            }
            state.consumers.push(Arc::clone(&consumer));
        }
        if !producer.attach(&consumer) {
            consumer.shutdown(CloseReason::ProducerClosed);
            return Err(EngineError::UnknownProducer(producer_id.clone()));
        }

        Ok(consumer)
    }

    fn close(&self) {
        let (producers, consumers) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };

        debug!(
            transport_id = %self.id,
            producers = producers.len(),
            consumers = consumers.len(),
            "Loopback transport closed"
        );

        for producer in producers {
            producer.close();
        }
        for consumer in consumers {
            consumer.shutdown(CloseReason::TransportClosed);
        }
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router_producers: Weak<DashMap<ProducerId, Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
    closed: AtomicBool,
}

impl LoopbackProducer {
    /// Bind a consumer; returns false when the producer is already closed
    fn attach(&self, consumer: &Arc<LoopbackConsumer>) -> bool {
        let mut consumers = self.consumers.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        consumers.push(Arc::downgrade(consumer));
        true
    }
}

impl EngineProducer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        let consumers = {
            let mut consumers = self.consumers.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *consumers)
        };

        if let Some(producers) = self.router_producers.upgrade() {
            producers.remove(&self.id);
        }
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.shutdown(CloseReason::ProducerClosed);
        }
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl LoopbackConsumer {
    fn shutdown(&self, reason: CloseReason) {
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed_tx.borrow().is_some() {
            return Err(EngineError::InvalidState(format!("consumer {} is closed", self.id)));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.shutdown(CloseReason::Local);
    }

    fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }
}
