//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
use std::collections::VecDeque;

use log::*;

use super::peer::PeerEvent;
use super::{DisconnectReason, PeerId};
use crate::wire::NetworkMessage;

/// Output of a state transition of a peer state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Out {
    /// Send a message to the peer.
    Message(NetworkMessage),
    /// Notify the sync manager.
    Event(PeerEvent),
    /// Disconnect from the peer.
    Disconnect(DisconnectReason),
}

/// Holds outputs of a peer state machine until the reactor carries them out.
#[derive(Debug)]
pub struct Outbox {
    /// Peer these outputs are for.
    peer: PeerId,
    /// Output queue.
    outbound: VecDeque<Out>,
}

impl Iterator for Outbox {
    type Item = Out;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Out> {
        self.outbound.pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            outbound: VecDeque::new(),
        }
    }

    /// Drain the outbound queue.
    pub fn drain(&mut self) -> impl Iterator<Item = Out> + '_ {
        self.outbound.drain(..)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Queue a message.
    pub fn message(&mut self, msg: NetworkMessage) {
        debug!(target: "p2p", "{}: Sending {:?}", self.peer, msg.cmd());

        self.outbound.push_back(Out::Message(msg));
    }

    /// Queue an event.
    pub fn event(&mut self, event: PeerEvent) {
        self.outbound.push_back(Out::Event(event));
    }

    /// Queue a disconnection.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        debug!(target: "p2p", "{}: Disconnecting: {}", self.peer, reason);

        self.outbound.push_back(Out::Disconnect(reason));
    }
}
