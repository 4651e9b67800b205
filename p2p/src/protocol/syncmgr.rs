//!
//! Manages header synchronization with peers.
//!
//! The sync manager keeps a registry of negotiated peers, picks the peer to
//! download headers from, and evicts it if it turns out to be too slow.
//!
use std::collections::{HashMap, VecDeque};

use log::*;

use headerchain_common::block::time::{LocalDuration, LocalTime};
use headerchain_common::block::Height;

use super::peer::{Command, PeerEvent};
use super::{DisconnectReason, PeerId};

/// How often the sync peer's speed is checked.
pub const SPEED_CHECK_INTERVAL: LocalDuration = LocalDuration::from_secs(30);
/// How long the sync peer may go without sending us a new header.
pub const HEADERS_TIMEOUT: LocalDuration = LocalDuration::from_mins(3);
/// Number of consecutive speed violations before the sync peer is evicted.
pub const MAX_SPEED_VIOLATIONS: u32 = 3;

/// State of a negotiated peer.
#[derive(Debug)]
struct Peer {
    /// Best height known for this peer.
    last_block: Height,
    /// Bytes received from this peer.
    bytes_received: u64,
    /// Bytes received at the last speed check.
    bytes_checked: u64,
    /// Consecutive speed violations.
    violations: u32,
    /// Last time this peer gave us a new header, or was selected.
    last_header: LocalTime,
    /// Whether the peer told us it has nothing more.
    idle: bool,
}

/// Sync manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum sync peer speed, in bytes per second.
    pub min_speed: u64,
}

/// Selects the sync peer and keeps it honest.
#[derive(Debug)]
pub struct SyncManager {
    config: Config,
    peers: HashMap<PeerId, Peer>,
    sync_peer: Option<PeerId>,
    /// Our tip height.
    tip: Height,
    last_check: Option<LocalTime>,
    rng: fastrand::Rng,
    outbox: VecDeque<(PeerId, Command)>,
}

impl SyncManager {
    /// Create a new sync manager.
    pub fn new(config: Config, tip: Height, rng: fastrand::Rng) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            sync_peer: None,
            tip,
            last_check: None,
            rng,
            outbox: VecDeque::new(),
        }
    }

    /// The current sync peer.
    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    /// Our tip height, as last seen.
    pub fn tip(&self) -> Height {
        self.tip
    }

    /// Highest height advertised by a peer.
    pub fn best_height(&self) -> Option<Height> {
        self.peers.values().map(|p| p.last_block).max()
    }

    /// Number of negotiated peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are no negotiated peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drain the commands for peers.
    pub fn drain(&mut self) -> impl Iterator<Item = (PeerId, Command)> + '_ {
        self.outbox.drain(..)
    }

    /// Process an event from a peer.
    pub fn received_event(&mut self, id: PeerId, event: PeerEvent, now: LocalTime) {
        match event {
            PeerEvent::Negotiated { height, .. } => self.peer_negotiated(id, height, now),
            PeerEvent::HeadersProcessed { inserted, tip } => {
                self.tip = self.tip.max(tip);

                if let Some(peer) = self.peers.get_mut(&id) {
                    if inserted > 0 {
                        peer.last_header = now;
                        peer.last_block = peer.last_block.max(tip);
                        peer.idle = false;
                    }
                }
            }
            PeerEvent::Idle { tip } => {
                self.tip = self.tip.max(tip);

                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.idle = true;
                    peer.last_block = peer.last_block.min(tip);
                }
                if self.sync_peer == Some(id) {
                    self.sync_peer = None;
                    self.select(now);
                }
            }
            PeerEvent::Addresses(_) => {}
        }
    }

    /// A peer completed the handshake.
    pub fn peer_negotiated(&mut self, id: PeerId, height: Height, now: LocalTime) {
        self.peers.insert(
            id,
            Peer {
                last_block: height,
                bytes_received: 0,
                bytes_checked: 0,
                violations: 0,
                last_header: now,
                idle: false,
            },
        );
        self.select(now);
    }

    /// A peer disconnected.
    pub fn peer_disconnected(&mut self, id: &PeerId, now: LocalTime) {
        self.peers.remove(id);

        if self.sync_peer == Some(*id) {
            self.sync_peer = None;
            self.select(now);
        }
    }

    /// Bytes were received from a peer.
    pub fn received_bytes(&mut self, id: &PeerId, bytes: usize) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.bytes_received = peer.bytes_received.saturating_add(bytes as u64);
        }
    }

    /// A header was added to the longest chain.
    pub fn header_added(&mut self, height: Height) {
        self.tip = self.tip.max(height);
    }

    /// Advance the clock.
    pub fn tick(&mut self, now: LocalTime) {
        let last_check = *self.last_check.get_or_insert(now);
        let elapsed = now - last_check;

        if elapsed >= SPEED_CHECK_INTERVAL {
            self.last_check = Some(now);
            self.check_sync_peer(elapsed, now);

            for peer in self.peers.values_mut() {
                peer.bytes_checked = peer.bytes_received;
            }
        }
        self.select(now);
    }

    fn check_sync_peer(&mut self, elapsed: LocalDuration, now: LocalTime) {
        let Some(id) = self.sync_peer else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let bytes = peer.bytes_received - peer.bytes_checked;
        let speed = bytes * 1000 / (elapsed.as_millis() as u64).max(1);

        if speed < self.config.min_speed {
            peer.violations += 1;
            debug!(
                target: "sync",
                "{}: Sync peer too slow: {} B/s (violation {}/{})",
                id, speed, peer.violations, MAX_SPEED_VIOLATIONS
            );
        } else {
            peer.violations = 0;
        }

        if peer.violations >= MAX_SPEED_VIOLATIONS {
            self.evict(id, DisconnectReason::PeerTooSlow);
        } else if now - peer.last_header >= HEADERS_TIMEOUT {
            self.evict(id, DisconnectReason::PeerTimeout("headers"));
        }
    }

    fn evict(&mut self, id: PeerId, reason: DisconnectReason) {
        info!(target: "sync", "{}: Evicting sync peer: {}", id, reason);

        self.peers.remove(&id);
        self.sync_peer = None;
        self.outbox.push_back((id, Command::Disconnect(reason)));
    }

    /// Pick a sync peer, if there's none.
    fn select(&mut self, now: LocalTime) {
        if self.sync_peer.is_some() {
            return;
        }
        let tip = self.tip;
        let mut ahead = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_block > tip)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        if ahead.is_empty() {
            ahead = self
                .peers
                .iter()
                .filter(|(_, p)| p.last_block == tip && !p.idle)
                .map(|(id, _)| *id)
                .collect();
        }
        if ahead.is_empty() {
            return;
        }
        // Iteration order of the registry isn't stable.
        ahead.sort();

        let id = ahead[self.rng.usize(..ahead.len())];
        if let Some(peer) = self.peers.get_mut(&id) {
            info!(
                target: "sync",
                "{}: Selected as sync peer (height = {}, tip = {})", id, peer.last_block, tip
            );
            peer.last_header = now;
            peer.violations = 0;
            peer.idle = false;
        }
        self.sync_peer = Some(id);
        self.outbox.push_back((id, Command::Sync));
    }
}
