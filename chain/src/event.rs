//! Chain events.
use std::fmt;
use std::sync::{Arc, Mutex};

use crossbeam_channel as chan;

use headerchain_common::block::store::{HeaderState, StoredHeader};
use headerchain_common::block::{BlockHash, BlockTime, Height, MerkleRoot, Work};

/// A header was inserted as, or moved into, the longest chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAdded {
    /// Header height.
    pub height: Height,
    /// Header hash.
    pub hash: BlockHash,
    /// Block version.
    pub version: i32,
    /// Merkle root.
    pub merkle_root: MerkleRoot,
    /// Block timestamp.
    pub timestamp: BlockTime,
    /// Proof-of-work nonce.
    pub nonce: u32,
    /// Header state. Always longest when emitted.
    pub state: HeaderState,
    /// Total work of the chain ending at this header.
    pub cumulated_work: Work,
    /// Hash of the previous header.
    pub prev_block: BlockHash,
}

impl From<&StoredHeader> for HeaderAdded {
    fn from(header: &StoredHeader) -> Self {
        Self {
            height: header.height,
            hash: header.hash,
            version: header.version,
            merkle_root: header.merkle_root,
            timestamp: header.time,
            nonce: header.nonce,
            state: header.state,
            cumulated_work: header.cumulated_work,
            prev_block: header.prev_blockhash,
        }
    }
}

impl fmt::Display for HeaderAdded {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Header {} added at height {}", self.hash, self.height)
    }
}

/// Any type that is able to publish events.
pub trait Publisher<E>: Send + Sync {
    /// Publish an event.
    fn publish(&self, event: E);
}

/// Publishes events to every subscriber over a channel. Subscribers that hang up
/// are dropped.
#[derive(Debug, Clone)]
pub struct Broadcast<E> {
    subscribers: Arc<Mutex<Vec<chan::Sender<E>>>>,
}

impl<E> Default for Broadcast<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone + Send> Broadcast<E> {
    /// Create a broadcast with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> chan::Receiver<E> {
        let (tx, rx) = chan::unbounded();

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }
}

impl<E: Clone + Send> Publisher<E> for Broadcast<E> {
    fn publish(&self, event: E) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|s| s.send(event.clone()).is_ok());
        }
    }
}
