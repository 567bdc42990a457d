//! Cleanup coordinator
//!
//! Releases everything a departing peer owned and tells the survivors.
//! Producer removal always cascades to the consumers fed by it, whichever
//! peer owns them, and every peer other than the owner gets `producerClosed`
//! whether it subscribed or only heard `newProducer`.

use std::sync::Arc;
use tracing::{debug, info};

use crate::fanout::Fanout;
use crate::protocol::{ProducerInfo, ServerMessage};
use crate::registry::{SessionRegistry, TransportRecord};
use crate::types::{ConsumerId, PeerId, ProducerId, TransportRole};

#[derive(Clone)]
pub struct CleanupCoordinator {
    registry: Arc<SessionRegistry>,
    fanout: Fanout,
}

impl CleanupCoordinator {
    pub const fn new(registry: Arc<SessionRegistry>, fanout: Fanout) -> Self {
        Self { registry, fanout }
    }

    /// Release a peer and everything it owns, then broadcast its departure.
    /// Returns false if the peer was not registered.
    pub fn release_peer(&self, peer_id: &PeerId) -> bool {
        let _gate = self.registry.publication();

        let Ok(peer) = self.registry.get(peer_id) else {
            debug!(peer_id = %peer_id, "Peer already released");
            return false;
        };

        for role in [TransportRole::Producer, TransportRole::Consumer] {
            if let Some(transport) = self.registry.detach_transport(peer_id, role) {
                transport.handle.close();
                debug!(peer_id = %peer_id, transport_id = %transport.id, role = %role, "Transport closed");
            }
        }

        let producer_count = peer.producers.len();
        for producer_id in &peer.producers {
            self.drop_producer(producer_id);
        }

        let mut consumer_count = 0;
        for consumer_id in &peer.consumers {
            if let Some(consumer) = self.registry.remove_consumer(consumer_id) {
                consumer.handle.close();
                consumer_count += 1;
            }
        }

        self.registry.remove(peer_id);
        let notified = self.fanout.notify(
            None,
            &ServerMessage::PeerDeparted {
                peer_id: peer_id.clone(),
            },
        );

        info!(
            peer_id = %peer_id,
            producers = producer_count,
            consumers = consumer_count,
            notified,
            "Peer released"
        );
        true
    }

    /// Close a transport that is no longer registered, with everything bound to it
    pub fn retire_transport(&self, transport: &TransportRecord) {
        let _gate = self.registry.publication();

        transport.handle.close();
        for producer_id in self.registry.producers_on_transport(&transport.id) {
            self.drop_producer(&producer_id);
        }
        for consumer_id in self.registry.consumers_on_transport(&transport.id) {
            if let Some(consumer) = self.registry.remove_consumer(&consumer_id) {
                consumer.handle.close();
            }
        }

        debug!(
            peer_id = %transport.owner,
            transport_id = %transport.id,
            role = %transport.role,
            "Replaced transport retired"
        );
    }

    /// Close one producer and cascade to its consumers. Returns false if it
    /// was not registered.
    pub fn close_producer(&self, producer_id: &ProducerId) -> bool {
        let _gate = self.registry.publication();
        self.drop_producer(producer_id)
    }

    /// The engine reported that a consumer's source producer closed
    pub fn consumer_source_closed(&self, consumer_id: &ConsumerId) {
        let _gate = self.registry.publication();

        // Nothing to do if a producer cascade already handled it
        let Some(consumer) = self.registry.consumer(consumer_id) else {
            return;
        };
        let source = &consumer.producer.producer_id;
        debug!(
            peer_id = %consumer.owner,
            consumer_id = %consumer_id,
            producer_id = %source,
            "Producer closed by the engine"
        );
        if !self.drop_producer(source) {
            self.forget_consumer(consumer_id);
        }
    }

    /// The engine closed a consumer for a reason other than its producer
    pub fn forget_consumer(&self, consumer_id: &ConsumerId) {
        if let Some(consumer) = self.registry.remove_consumer(consumer_id) {
            debug!(peer_id = %consumer.owner, consumer_id = %consumer_id, "Consumer closed");
        }
    }

    /// Gate must be held. Removes the consumers fed by the producer and
    /// announces the removal once to every peer except the owner.
    fn drop_producer(&self, producer_id: &ProducerId) -> bool {
        let Some((producer, dependents)) = self.registry.remove_producer(producer_id) else {
            return false;
        };
        producer.handle.close();

        let mut closed_consumers = 0;
        for consumer_id in dependents {
            if let Some(consumer) = self.registry.remove_consumer(&consumer_id) {
                consumer.handle.close();
                closed_consumers += 1;
            }
        }

        let info: ProducerInfo = producer.info();
        let notified = self
            .fanout
            .notify(Some(&producer.owner), &ServerMessage::ProducerClosed(info));

        info!(
            peer_id = %producer.owner,
            producer_id = %producer_id,
            kind = %producer.kind,
            consumers = closed_consumers,
            notified,
            "Producer closed"
        );
        true
    }
}
