//! Session registry
//!
//! Single source of truth for peers and the transports, producers and
//! consumers they own. Entities live in sharded maps keyed by id, so work on
//! different peers never contends on one lock. A reverse index from producer
//! to dependent consumers lets cleanup find every subscriber in O(1).
//!
//! Callers only see entity-scoped operations and owned snapshots; map guards
//! never leave this module.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use crate::error::{Result, SfuError};
use crate::protocol::{ProducerInfo, ServerMessage};
use crate::types::{
    ConsumerId, ConsumerState, MediaKind, PeerId, ProducerId, TransportId, TransportRole,
    TransportState,
};

/// Outbound channel of one peer
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

struct PeerEntry {
    sender: MessageSender,
    producer_transport: Option<TransportId>,
    consumer_transport: Option<TransportId>,
    producers: HashMap<ProducerId, MediaKind>,
    /// source producer -> this peer's consumer of it
    consumers: HashMap<ProducerId, ConsumerId>,
    joined_at: DateTime<Utc>,
}

impl PeerEntry {
    fn slot(&mut self, role: TransportRole) -> &mut Option<TransportId> {
        match role {
            TransportRole::Producer => &mut self.producer_transport,
            TransportRole::Consumer => &mut self.consumer_transport,
        }
    }
}

/// Point-in-time view of a peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub producer_transport: Option<TransportId>,
    pub consumer_transport: Option<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub owner: PeerId,
    pub role: TransportRole,
    pub state: TransportState,
    pub handle: Arc<dyn EngineTransport>,
}

#[derive(Clone)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub owner: PeerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub handle: Arc<dyn EngineProducer>,
}

impl ProducerRecord {
    #[must_use]
    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            producer_id: self.id.clone(),
            peer_id: self.owner.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Clone)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    /// Subscribing peer
    pub owner: PeerId,
    pub producer: ProducerInfo,
    pub transport_id: TransportId,
    pub state: ConsumerState,
    pub handle: Arc<dyn EngineConsumer>,
}

/// Entity counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Default)]
pub struct SessionRegistry {
    peers: DashMap<PeerId, PeerEntry>,
    transports: DashMap<TransportId, TransportRecord>,
    producers: DashMap<ProducerId, ProducerRecord>,
    consumers: DashMap<ConsumerId, ConsumerRecord>,
    /// producer -> consumers fed by it
    dependents: DashMap<ProducerId, HashSet<ConsumerId>>,
    publication: Mutex<()>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the sections whose messages must be ordered against
    /// snapshots: join, producer publication, subscription and producer
    /// removal.
    ///
    /// This is one lock for the whole room rather than per entity. A join has
    /// to see a consistent set of producers across every owner, so the
    /// sections it orders against would need all per-peer locks anyway. The
    /// sections are short and synchronous; engine calls happen outside.
    ///
    /// Must not be held across an await point or while a map guard is alive.
    pub fn publication(&self) -> MutexGuard<'_, ()> {
        self.publication.lock()
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Register a new peer and return its generated session id
    pub fn register(&self, sender: MessageSender) -> PeerId {
        let id = PeerId::generate();
        self.peers.insert(
            id.clone(),
            PeerEntry {
                sender,
                producer_transport: None,
                consumer_transport: None,
                producers: HashMap::new(),
                consumers: HashMap::new(),
                joined_at: Utc::now(),
            },
        );
        debug!(peer_id = %id, "Peer registered");
        id
    }

    pub fn get(&self, peer_id: &PeerId) -> Result<PeerSnapshot> {
        let entry = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SfuError::not_found("peer", peer_id))?;
        Ok(PeerSnapshot {
            id: peer_id.clone(),
            producer_transport: entry.producer_transport.clone(),
            consumer_transport: entry.consumer_transport.clone(),
            producers: entry.producers.keys().cloned().collect(),
            consumers: entry.consumers.values().cloned().collect(),
            joined_at: entry.joined_at,
        })
    }

    /// Drop the peer entry (and with it the outbound channel). Returns false if absent.
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn sender(&self, peer_id: &PeerId) -> Option<MessageSender> {
        self.peers.get(peer_id).map(|entry| entry.sender.clone())
    }

    /// Outbound channels of every peer except `exclude`
    pub fn senders_except(&self, exclude: Option<&PeerId>) -> Vec<(PeerId, MessageSender)> {
        self.peers
            .iter()
            .filter(|entry| Some(entry.key()) != exclude)
            .map(|entry| (entry.key().clone(), entry.sender.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    /// The peer's transport for `role`, if any
    pub fn transport_for(&self, peer_id: &PeerId, role: TransportRole) -> Option<TransportRecord> {
        let id = {
            let entry = self.peers.get(peer_id)?;
            match role {
                TransportRole::Producer => entry.producer_transport.clone(),
                TransportRole::Consumer => entry.consumer_transport.clone(),
            }
        }?;
        self.transports.get(&id).map(|record| record.clone())
    }

    pub fn transport(&self, transport_id: &TransportId) -> Option<TransportRecord> {
        self.transports.get(transport_id).map(|record| record.clone())
    }

    /// Store a transport in its owner's role slot. Returns the transport it
    /// displaced, already unregistered; the caller closes it.
    pub fn attach_transport(&self, record: TransportRecord) -> Result<Option<TransportRecord>> {
        let id = record.id.clone();
        let owner = record.owner.clone();
        let role = record.role;
        self.transports.insert(id.clone(), record);

        let previous = match self.peers.get_mut(&owner) {
            Some(mut entry) => entry.slot(role).replace(id),
            None => {
                self.transports.remove(&id);
                return Err(SfuError::not_found("peer", owner));
            }
        };

        Ok(previous.and_then(|prev| self.transports.remove(&prev).map(|(_, record)| record)))
    }

    pub fn set_transport_state(&self, transport_id: &TransportId, state: TransportState) -> Result<()> {
        let mut record = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SfuError::not_found("transport", transport_id))?;
        record.state = state;
        Ok(())
    }

    /// Clear the peer's role slot and unregister the transport
    pub fn detach_transport(&self, peer_id: &PeerId, role: TransportRole) -> Option<TransportRecord> {
        let id = self.peers.get_mut(peer_id)?.slot(role).take()?;
        self.transports.remove(&id).map(|(_, record)| record)
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Register a producer under its owner; fails if the owner already
    /// produces that kind
    pub fn insert_producer(&self, record: ProducerRecord) -> Result<()> {
        {
            let mut entry = self
                .peers
                .get_mut(&record.owner)
                .ok_or_else(|| SfuError::not_found("peer", &record.owner))?;
            if entry.producers.values().any(|kind| *kind == record.kind) {
                return Err(SfuError::protocol(format!("already producing {}", record.kind)));
            }
            entry.producers.insert(record.id.clone(), record.kind);
        }
        self.producers.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Option<ProducerRecord> {
        self.producers.get(producer_id).map(|record| record.clone())
    }

    /// Id of the peer's producer of `kind`
    pub fn producer_of_kind(&self, peer_id: &PeerId, kind: MediaKind) -> Option<ProducerId> {
        self.peers.get(peer_id).and_then(|entry| {
            entry
                .producers
                .iter()
                .find(|(_, k)| **k == kind)
                .map(|(id, _)| id.clone())
        })
    }

    /// Unregister a producer. Returns the record together with the consumers
    /// that were fed by it; those are still registered and must be removed by
    /// the caller.
    pub fn remove_producer(&self, producer_id: &ProducerId) -> Option<(ProducerRecord, Vec<ConsumerId>)> {
        let (_, record) = self.producers.remove(producer_id)?;
        if let Some(mut entry) = self.peers.get_mut(&record.owner) {
            entry.producers.remove(producer_id);
        }
        let dependents = self
            .dependents
            .remove(producer_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();
        Some((record, dependents))
    }

    /// Every active producer not owned by `exclude`
    pub fn producers_except(&self, exclude: &PeerId) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .filter(|record| record.owner != *exclude)
            .map(|record| record.info())
            .collect()
    }

    pub fn producers_on_transport(&self, transport_id: &TransportId) -> Vec<ProducerId> {
        self.producers
            .iter()
            .filter(|record| record.transport_id == *transport_id)
            .map(|record| record.id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Register a consumer under its subscriber and in the reverse index of
    /// its source producer. A peer holds at most one consumer per producer.
    /// Fails if the producer has already gone away.
    pub fn insert_consumer(&self, record: ConsumerRecord) -> Result<()> {
        let id = record.id.clone();
        let owner = record.owner.clone();
        let producer_id = record.producer.producer_id.clone();

        match self.peers.get_mut(&owner) {
            Some(mut entry) => {
                if entry.consumers.contains_key(&producer_id) {
                    return Err(SfuError::protocol(format!("already consuming producer {producer_id}")));
                }
                entry.consumers.insert(producer_id.clone(), id.clone());
            }
            None => return Err(SfuError::not_found("peer", owner)),
        }
        self.consumers.insert(id.clone(), record);

        // The producer read guard keeps remove_producer out until the
        // dependent is indexed, so it always sees this consumer.
        let linked = match self.producers.get(&producer_id) {
            Some(_producer) => {
                self.dependents.entry(producer_id.clone()).or_default().insert(id.clone());
                true
            }
            None => false,
        };

        if linked {
            Ok(())
        } else {
            self.consumers.remove(&id);
            if let Some(mut entry) = self.peers.get_mut(&owner) {
                entry.consumers.remove(&producer_id);
            }
            Err(SfuError::not_found("producer", producer_id))
        }
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<ConsumerRecord> {
        self.consumers.get(consumer_id).map(|record| record.clone())
    }

    /// The consumer `peer_id` already has on `producer_id`, if any
    pub fn subscription(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Option<ConsumerRecord> {
        let consumer_id = self.peers.get(peer_id)?.consumers.get(producer_id)?.clone();
        self.consumer(&consumer_id)
    }

    /// Unregister a consumer from every index. Returns None if already gone.
    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> Option<ConsumerRecord> {
        let (_, record) = self.consumers.remove(consumer_id)?;
        if let Some(mut entry) = self.peers.get_mut(&record.owner) {
            let source = &record.producer.producer_id;
            if entry.consumers.get(source) == Some(consumer_id) {
                entry.consumers.remove(source);
            }
        }
        self.dependents
            .remove_if_mut(&record.producer.producer_id, |_, set| {
                set.remove(consumer_id);
                set.is_empty()
            });
        Some(record)
    }

    pub fn set_consumer_state(&self, consumer_id: &ConsumerId, state: ConsumerState) -> bool {
        match self.consumers.get_mut(consumer_id) {
            Some(mut record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// Consumers currently fed by `producer_id`
    pub fn dependents_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.dependents
            .get(producer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumers_on_transport(&self, transport_id: &TransportId) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|record| record.transport_id == *transport_id)
            .map(|record| record.id.clone())
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            peers: self.peers.len(),
            transports: self.transports.len(),
            producers: self.producers.len(),
            consumers: self.consumers.len(),
        }
    }
}
