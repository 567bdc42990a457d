//! Notification fan-out
//!
//! Delivery to each peer is independent: a peer whose channel is gone is
//! logged and skipped, the rest still receive the message. Peers whose
//! channel closed are released by their own connection task, not here.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;
use crate::types::PeerId;

#[derive(Clone)]
pub struct Fanout {
    registry: Arc<SessionRegistry>,
}

impl Fanout {
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `message` to every registered peer except `exclude`.
    /// Returns the number of peers it was handed to.
    pub fn notify(&self, exclude: Option<&PeerId>, message: &ServerMessage) -> usize {
        let mut sent_count = 0;

        for (peer_id, sender) in self.registry.senders_except(exclude) {
            match sender.send(message.clone()) {
                Ok(()) => sent_count += 1,
                Err(err) => {
                    warn!(
                        peer_id = %peer_id,
                        action = message.action(),
                        error = %err,
                        "Failed to deliver notification, skipping peer"
                    );
                }
            }
        }

        if sent_count > 0 {
            debug!(
                action = message.action(),
                sent_count = sent_count,
                "Notification fan-out complete"
            );
        }

        sent_count
    }

    /// Deliver `message` to one peer. Returns false if the peer is gone or
    /// its channel is closed.
    pub fn send_to(&self, peer_id: &PeerId, message: ServerMessage) -> bool {
        let Some(sender) = self.registry.sender(peer_id) else {
            debug!(peer_id = %peer_id, action = message.action(), "Peer not registered, message dropped");
            return false;
        };

        let action = message.action();
        match sender.send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(peer_id = %peer_id, action, error = %err, "Failed to send message to peer");
                false
            }
        }
    }
}
