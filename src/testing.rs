use std::collections::HashSet;

use parking_lot::Mutex;

use crate::{
    error::DeliveryError,
    peer::PeerId,
    protocol::GossipMessage,
    transport::Transport,
};

/// Records every sent message instead of delivering it. Sends to peers marked
/// unreachable fail.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, GossipMessage)>>,
    unreachable: Mutex<HashSet<PeerId>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn unreachable(&self, peer: PeerId) {
        self.unreachable.lock().insert(peer);
    }

    /// Drains the messages sent so far
    pub(crate) fn take(&self) -> Vec<(PeerId, GossipMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, target: PeerId, message: GossipMessage) -> Result<(), DeliveryError> {
        if self.unreachable.lock().contains(&target) {
            return Err(DeliveryError::UnknownPeer(target));
        }
        self.sent.lock().push((target, message));
        Ok(())
    }
}
