use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{error::DeliveryError, peer::PeerId, protocol::GossipMessage, Event};

/// Hands gossip messages over to remote peers.
///
/// This is the boundary with whatever carries bytes between peers (data
/// channels, sockets...). Implementations must not block: queue the message
/// and return. Delivery is best effort, and the overlay never assumes messages
/// arrive, nor that they arrive in order.
pub trait Transport: Send + Sync {
    fn send(&self, target: PeerId, message: GossipMessage) -> Result<(), DeliveryError>;
}

/// The inbound side of a running coordinator.
///
/// Transports hand every message they receive to [Inbox::deliver], which queues it
/// for the coordinator's main loop.
#[derive(Clone, Debug)]
pub struct Inbox {
    pub(crate) peer: PeerId,
    pub(crate) events: mpsc::UnboundedSender<Event>,
}

impl Inbox {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn deliver(&self, message: GossipMessage) -> Result<(), DeliveryError> {
        self.events
            .send(Event::MessageReceived(message))
            .map_err(|_| DeliveryError::Disconnected(self.peer))
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// An in-process network connecting the inboxes of several coordinators.
///
/// Useful to simulate an overlay within one process. Cloning a [LocalNetwork]
/// gives another handle on the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inboxes: Arc<RwLock<HashMap<PeerId, Inbox>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, inbox: Inbox) {
        self.inboxes.write().insert(inbox.peer(), inbox);
    }

    /// Disconnects a peer. Messages sent to it fail with [DeliveryError::UnknownPeer] from now on.
    pub fn leave(&self, peer: &PeerId) {
        self.inboxes.write().remove(peer);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inboxes.read().keys().copied().collect();
        peers.sort();
        peers
    }
}

impl Transport for LocalNetwork {
    fn send(&self, target: PeerId, message: GossipMessage) -> Result<(), DeliveryError> {
        let inbox = self
            .inboxes
            .read()
            .get(&target)
            .cloned()
            .ok_or(DeliveryError::UnknownPeer(target))?;
        inbox.deliver(message)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{MessageKind, ProtocolId};

    fn message(sender: u64) -> GossipMessage {
        GossipMessage {
            sender_id: PeerId::new(sender),
            protocol_id: ProtocolId::from("cyclon"),
            kind: MessageKind::Push,
            buffer: Vec::new(),
        }
    }

    #[test]
    fn local_network_delivers_to_joined_peers_only() {
        let network = LocalNetwork::new();
        let (events, mut received) = mpsc::unbounded_channel();
        network.join(Inbox {
            peer: PeerId::new(2),
            events,
        });

        network.send(PeerId::new(2), message(1)).unwrap();
        assert!(matches!(
            received.try_recv(),
            Ok(Event::MessageReceived(m)) if m.sender_id == PeerId::new(1)
        ));

        assert_eq!(
            network.send(PeerId::new(3), message(1)),
            Err(DeliveryError::UnknownPeer(PeerId::new(3)))
        );

        network.leave(&PeerId::new(2));
        assert!(network.peers().is_empty());
        assert_eq!(
            network.send(PeerId::new(2), message(1)),
            Err(DeliveryError::UnknownPeer(PeerId::new(2)))
        );
    }

    #[test]
    fn closed_inboxes_report_a_disconnection() {
        let (events, received) = mpsc::unbounded_channel();
        let inbox = Inbox {
            peer: PeerId::new(4),
            events,
        };
        drop(received);
        assert!(inbox.is_closed());
        assert_eq!(
            inbox.deliver(message(1)),
            Err(DeliveryError::Disconnected(PeerId::new(4)))
        );
    }
}
