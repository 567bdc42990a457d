//! Per-peer negotiation state machine
//!
//! A [`PeerSession`] interprets the inbound messages of one connection. The
//! caller feeds it one message at a time, so handlers for the same peer never
//! overlap while different peers run concurrently. Engine calls are awaited
//! first and the registry is only written once they have succeeded.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::engine::{CloseReason, EngineError};
use crate::error::{Result, SfuError};
use crate::manager::SfuManager;
use crate::params::DtlsParameters;
use crate::protocol::{ClientMessage, Consume, ConsumeFailure, ParseError, Produce, ServerMessage};
use crate::registry::{ConsumerRecord, ProducerRecord, TransportRecord};
use crate::types::{ConsumerId, ConsumerState, PeerId, ProducerId, TransportRole, TransportState};

fn consumer_created(record: &ConsumerRecord) -> ServerMessage {
    ServerMessage::ConsumerCreated {
        producer_id: record.producer.producer_id.clone(),
        id: record.id.clone(),
        kind: record.producer.kind,
        rtp_parameters: record.handle.rtp_parameters(),
        producer_peer_id: record.producer.peer_id.clone(),
    }
}

const fn transport_entity(role: TransportRole) -> &'static str {
    match role {
        TransportRole::Producer => "producer transport",
        TransportRole::Consumer => "consumer transport",
    }
}

/// Signaling state of one connected peer
pub struct PeerSession {
    peer_id: PeerId,
    manager: Arc<SfuManager>,
    released: bool,
}

impl PeerSession {
    pub(crate) const fn new(peer_id: PeerId, manager: Arc<SfuManager>) -> Self {
        Self {
            peer_id,
            manager,
            released: false,
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Decode and handle one text frame
    pub async fn handle_text(&self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(err @ ParseError::Malformed(_)) => {
                warn!(peer_id = %self.peer_id, error = %err, "Dropping malformed message");
            }
            Err(err @ ParseError::InvalidData { .. }) => {
                warn!(peer_id = %self.peer_id, error = %err, "Rejecting message");
                self.reply(ServerMessage::error(SfuError::protocol(err.to_string())));
            }
        }
    }

    /// Handle one decoded message. Failures are answered with an `error`
    /// message and never end the session.
    #[instrument(skip_all, fields(peer_id = %self.peer_id, action = message.action()))]
    pub async fn handle(&self, message: ClientMessage) {
        let result = match message {
            ClientMessage::CreateProducerTransport => self.create_transport(TransportRole::Producer).await,
            ClientMessage::ConnectProducerTransport(request) => {
                self.connect_transport(TransportRole::Producer, request.dtls_parameters)
                    .await
            }
            ClientMessage::Produce(request) => self.produce(request).await,
            ClientMessage::CreateConsumerTransport => self.create_transport(TransportRole::Consumer).await,
            ClientMessage::ConnectConsumerTransport(request) => {
                self.connect_transport(TransportRole::Consumer, request.dtls_parameters)
                    .await
            }
            ClientMessage::Consume(request) => self.consume(request).await,
            ClientMessage::ResumeConsumer(request) => {
                self.resume_consumer(&request.consumer_id).await;
                Ok(())
            }
            ClientMessage::CloseProducer(request) => self.close_producer(&request.producer_id),
            ClientMessage::Unknown { action } => {
                warn!(action = %action, "Ignoring unknown action");
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(error = %err, "Request failed");
            self.reply(ServerMessage::error(err));
        }
    }

    /// Release the peer: close its transports, producers and consumers and
    /// tell everyone else it left
    pub fn leave(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.cleanup().release_peer(&self.peer_id);
        }
    }

    fn reply(&self, message: ServerMessage) {
        self.manager.fanout().send_to(&self.peer_id, message);
    }

    async fn create_transport(&self, role: TransportRole) -> Result<()> {
        let handle = self
            .manager
            .router()
            .create_webrtc_transport(&self.manager.config().webrtc_transport)
            .await?;
        let id = handle.id();

        let record = TransportRecord {
            id: id.clone(),
            owner: self.peer_id.clone(),
            role,
            state: TransportState::Created,
            handle: Arc::clone(&handle),
        };
        let displaced = match self.manager.registry().attach_transport(record) {
            Ok(displaced) => displaced,
            Err(err) => {
                handle.close();
                return Err(err);
            }
        };
        if let Some(previous) = displaced {
            self.manager.cleanup().retire_transport(&previous);
        }

        debug!(transport_id = %id, role = %role, "Transport created");

        let parameters = handle.parameters();
        self.reply(match role {
            TransportRole::Producer => ServerMessage::ProducerTransportCreated { id, parameters },
            TransportRole::Consumer => ServerMessage::ConsumerTransportCreated { id, parameters },
        });
        Ok(())
    }

    async fn connect_transport(&self, role: TransportRole, dtls_parameters: DtlsParameters) -> Result<()> {
        let registry = self.manager.registry();
        let transport = registry
            .transport_for(&self.peer_id, role)
            .ok_or_else(|| SfuError::not_found(transport_entity(role), &self.peer_id))?;
        if transport.state != TransportState::Created {
            return Err(SfuError::protocol(format!("{role} transport is already connected")));
        }

        transport.handle.connect(dtls_parameters).await?;
        registry.set_transport_state(&transport.id, TransportState::Connected)?;

        debug!(transport_id = %transport.id, role = %role, "Transport connected");
        Ok(())
    }

    /// The peer's transport for `role`, required to be connected
    fn connected_transport(&self, role: TransportRole) -> Result<TransportRecord> {
        let transport = self
            .manager
            .registry()
            .transport_for(&self.peer_id, role)
            .ok_or_else(|| SfuError::not_found(transport_entity(role), &self.peer_id))?;
        if transport.state == TransportState::Connected {
            Ok(transport)
        } else {
            Err(SfuError::protocol(format!("{role} transport is not connected")))
        }
    }

    async fn produce(&self, request: Produce) -> Result<()> {
        let Produce { kind, rtp_parameters } = request;

        let transport = self.connected_transport(TransportRole::Producer)?;
        if self.manager.registry().producer_of_kind(&self.peer_id, kind).is_some() {
            return Err(SfuError::protocol(format!("already producing {kind}")));
        }

        let handle = transport.handle.produce(kind, rtp_parameters).await?;
        let record = ProducerRecord {
            id: handle.id(),
            owner: self.peer_id.clone(),
            kind: handle.kind(),
            transport_id: transport.id,
            handle: Arc::clone(&handle),
        };

        if let Err(err) = self.publish(record) {
            handle.close();
            return Err(err);
        }
        Ok(())
    }

    /// Register a producer, acknowledge it, then announce it to everyone
    /// else. The acknowledgement always precedes the broadcast.
    fn publish(&self, record: ProducerRecord) -> Result<()> {
        let registry = self.manager.registry();
        let _gate = registry.publication();

        let info = record.info();
        registry.insert_producer(record)?;
        self.reply(ServerMessage::ProducerCreated {
            id: info.producer_id.clone(),
        });
        let notified = self
            .manager
            .fanout()
            .notify(Some(&self.peer_id), &ServerMessage::NewProducer(info.clone()));

        debug!(producer_id = %info.producer_id, kind = %info.kind, notified, "Producer published");
        Ok(())
    }

    /// Answer `consume`. Refusals the client can act on come back as
    /// `consumeFailed`; anything else is an `error`.
    async fn consume(&self, request: Consume) -> Result<()> {
        let producer_id = request.producer_id.clone();
        match self.try_consume(request).await {
            Err(err) => match ConsumeFailure::from_error(&err) {
                Some(reason) => {
                    debug!(producer_id = %producer_id, reason = %reason, "Consume refused");
                    self.reply(ServerMessage::ConsumeFailed { producer_id, reason });
                    Ok(())
                }
                None => Err(err),
            },
            ok => ok,
        }
    }

    async fn try_consume(&self, request: Consume) -> Result<()> {
        let Consume {
            producer_id,
            rtp_capabilities,
        } = request;
        let registry = self.manager.registry();

        let producer = registry
            .producer(&producer_id)
            .ok_or_else(|| SfuError::not_found("producer", &producer_id))?;
        if !self
            .manager
            .router()
            .can_consume(&producer_id, &rtp_capabilities)
            .await
        {
            return Err(SfuError::Incompatible(producer_id));
        }
        let transport = self
            .connected_transport(TransportRole::Consumer)
            .map_err(|_| SfuError::not_found(transport_entity(TransportRole::Consumer), &self.peer_id))?;

        if self.replay_subscription(&producer_id) {
            return Ok(());
        }

        let handle = transport
            .handle
            .consume(&producer_id, &rtp_capabilities)
            .await
            .map_err(|err| match err {
                EngineError::UnknownProducer(id) => SfuError::not_found("producer", id),
                EngineError::Unsupported(_) => SfuError::Incompatible(producer_id.clone()),
                other => other.into(),
            })?;

        let consumer_id = handle.id();
        let closed = handle.closed();
        let record = ConsumerRecord {
            id: consumer_id.clone(),
            owner: self.peer_id.clone(),
            producer: producer.info(),
            transport_id: transport.id,
            state: ConsumerState::Created,
            handle: Arc::clone(&handle),
        };

        if let Err(err) = self.subscribe(record) {
            handle.close();
            return Err(err);
        }

        self.watch_consumer(consumer_id, closed);
        Ok(())
    }

    /// Register a consumer and reply with its parameters. Runs under the
    /// publication gate so a `producerClosed` for it can never overtake the
    /// `consumerCreated`.
    fn subscribe(&self, record: ConsumerRecord) -> Result<()> {
        let registry = self.manager.registry();
        let _gate = registry.publication();

        let reply = consumer_created(&record);
        registry.insert_consumer(record)?;
        self.reply(reply);
        Ok(())
    }

    /// Answer a repeated `consume` with the consumer the peer already holds
    /// on that producer. Returns false if there is none.
    fn replay_subscription(&self, producer_id: &ProducerId) -> bool {
        let registry = self.manager.registry();
        let _gate = registry.publication();

        let Some(existing) = registry.subscription(&self.peer_id, producer_id) else {
            return false;
        };
        debug!(consumer_id = %existing.id, producer_id = %producer_id, "Already consuming, replaying consumer");
        self.reply(consumer_created(&existing));
        true
    }

    /// Follow the consumer's close event so a producer lost inside the engine
    /// still reaches the room and the registry
    fn watch_consumer(&self, consumer_id: ConsumerId, mut closed: watch::Receiver<Option<CloseReason>>) {
        let cleanup = self.manager.cleanup().clone();
        tokio::spawn(async move {
            let reason = match closed.wait_for(Option::is_some).await {
                Ok(reason) => *reason,
                Err(_) => None,
            };
            match reason {
                Some(CloseReason::ProducerClosed) => cleanup.consumer_source_closed(&consumer_id),
                _ => cleanup.forget_consumer(&consumer_id),
            }
        });
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) {
        let registry = self.manager.registry();
        let Some(consumer) = registry
            .consumer(consumer_id)
            .filter(|consumer| consumer.owner == self.peer_id)
        else {
            debug!(consumer_id = %consumer_id, "Resume ignored: unknown consumer");
            return;
        };
        if consumer.state != ConsumerState::Created {
            debug!(consumer_id = %consumer_id, "Resume ignored: already resumed");
            return;
        }

        match consumer.handle.resume().await {
            Ok(()) => {
                registry.set_consumer_state(consumer_id, ConsumerState::Resumed);
                debug!(consumer_id = %consumer_id, "Consumer resumed");
            }
            Err(err) => {
                warn!(consumer_id = %consumer_id, error = %err, "Resume failed");
            }
        }
    }

    fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        let owned = self
            .manager
            .registry()
            .producer(producer_id)
            .is_some_and(|producer| producer.owner == self.peer_id);
        if !owned {
            return Err(SfuError::not_found("producer", producer_id));
        }
        self.manager.cleanup().close_producer(producer_id);
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::engine::MockMediaRouter;
    use crate::loopback::LoopbackEngine;
    use crate::params::RtpCapabilities;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn failing_router() -> Arc<dyn crate::engine::MediaRouter> {
        let mut router = MockMediaRouter::new();
        router.expect_rtp_capabilities().returning(RtpCapabilities::default);
        router
            .expect_create_webrtc_transport()
            .returning(|_| Err(EngineError::Internal("worker died".to_string())));
        router.expect_can_consume().returning(|_, _| false);
        Arc::new(router)
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_state_unchanged() {
        let manager = SfuManager::new(SfuConfig::default(), failing_router());
        let (session, mut rx) = manager.join().unwrap();
        drain(&mut rx);

        session.handle(ClientMessage::CreateProducerTransport).await;

        let messages = drain(&mut rx);
        assert_eq!(
            messages,
            vec![ServerMessage::error("media engine error: engine failure: worker died")]
        );
        let peer = manager.registry().get(session.peer_id()).unwrap();
        assert!(peer.producer_transport.is_none());
        assert_eq!(manager.stats().transports, 0);
    }

    #[tokio::test]
    async fn test_connect_without_transport_is_not_found() {
        let manager = SfuManager::with_engine(SfuConfig::default(), &LoopbackEngine::new())
            .await
            .unwrap();
        let (session, mut rx) = manager.join().unwrap();
        drain(&mut rx);

        session
            .handle_text(
                r#"{"action":"connectConsumerTransport","data":{"dtlsParameters":{"fingerprints":[{"algorithm":"sha-256","value":"AA"}]}}}"#,
            )
            .await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        let ServerMessage::Error { message } = &messages[0] else {
            panic!("expected error, got {messages:?}");
        };
        assert!(message.starts_with("consumer transport not found"));
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let manager = SfuManager::with_engine(SfuConfig::default(), &LoopbackEngine::new())
            .await
            .unwrap();
        let (session, mut rx) = manager.join().unwrap();
        session.handle(ClientMessage::CreateProducerTransport).await;
        drain(&mut rx);

        session
            .handle(ClientMessage::Produce(Produce {
                kind: crate::types::MediaKind::Video,
                rtp_parameters: crate::loopback::tests::vp8_parameters(),
            }))
            .await;

        let messages = drain(&mut rx);
        assert!(matches!(&messages[..], [ServerMessage::Error { message }] if message.contains("not connected")));
        assert_eq!(manager.stats().producers, 0);
    }

    #[tokio::test]
    async fn test_leave_runs_once() {
        let manager = SfuManager::with_engine(SfuConfig::default(), &LoopbackEngine::new())
            .await
            .unwrap();
        let (a, _rx_a) = manager.join().unwrap();
        let (_b, mut rx_b) = manager.join().unwrap();
        drain(&mut rx_b);

        let a_id = a.peer_id().clone();
        a.leave();

        assert_eq!(drain(&mut rx_b), vec![ServerMessage::PeerDeparted { peer_id: a_id }]);
        assert_eq!(manager.stats().peers, 1);
    }

    #[tokio::test]
    async fn test_dropped_session_is_released() {
        let manager = SfuManager::with_engine(SfuConfig::default(), &LoopbackEngine::new())
            .await
            .unwrap();
        let (a, rx_a) = manager.join().unwrap();
        drop(a);
        drop(rx_a);

        assert_eq!(manager.stats().peers, 0);
    }

    #[tokio::test]
    async fn test_join_over_capacity() {
        let config = SfuConfig {
            max_peers: 1,
            ..SfuConfig::default()
        };
        let manager = SfuManager::with_engine(config, &LoopbackEngine::new()).await.unwrap();
        let (_a, _rx_a) = manager.join().unwrap();

        assert!(matches!(manager.join(), Err(SfuError::Capacity(_))));
    }
}
