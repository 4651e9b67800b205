//! Peer connection manager.
//!
//! Keeps the number of outbound connections at target, within the total and
//! per-IP caps, and returns addresses to the address manager when connections
//! end.
use std::collections::{HashMap, HashSet};
use std::net;

use log::*;

use headerchain_common::block::time::{LocalDuration, LocalTime};

use super::addrmgr::AddressManager;
use super::{DisconnectReason, Link, PeerId};

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target number of outbound peer connections.
    pub target_outbound_peers: usize,
    /// Maximum number of peers.
    pub max_peers: usize,
    /// Maximum number of peers sharing an IP.
    pub max_peers_per_ip: usize,
    /// TCP dial timeout.
    pub connect_timeout: LocalDuration,
}

impl From<&super::Config> for Config {
    fn from(cfg: &super::Config) -> Self {
        Self {
            target_outbound_peers: cfg.target_outbound_peers,
            max_peers: cfg.max_peers,
            max_peers_per_ip: cfg.max_peers_per_ip,
            connect_timeout: cfg.connect_timeout,
        }
    }
}

/// A connected peer.
#[derive(Debug)]
struct Peer {
    link: Link,
    negotiated: bool,
}

/// Manages peer connections.
#[derive(Debug)]
pub struct ConnectionManager {
    config: Config,
    /// Addresses being dialed.
    connecting: HashSet<PeerId>,
    /// Connected peers.
    connected: HashMap<PeerId, Peer>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connecting: HashSet::new(),
            connected: HashMap::new(),
        }
    }

    /// TCP dial timeout.
    pub fn connect_timeout(&self) -> LocalDuration {
        self.config.connect_timeout
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.connected.len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    /// Number of outbound connections, including those being dialed.
    pub fn outbound(&self) -> usize {
        self.connecting.len()
            + self
                .connected
                .values()
                .filter(|p| p.link.is_outbound())
                .count()
    }

    /// Whether we're connected to, or dialing, this address.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.connecting.contains(addr) || self.connected.contains_key(addr)
    }

    fn total(&self) -> usize {
        self.connecting.len() + self.connected.len()
    }

    fn count_ip(&self, ip: &net::IpAddr) -> usize {
        self.connecting
            .iter()
            .chain(self.connected.keys())
            .filter(|addr| addr.ip() == *ip)
            .count()
    }

    /// Pick addresses to dial, so that outbound connections reach the target.
    /// The returned addresses are marked as used.
    pub fn maintain(&mut self, addrs: &mut AddressManager, now: LocalTime) -> Vec<PeerId> {
        let mut dial = Vec::new();
        // Bounds the number of samples, since a sampled address may be over the
        // per-IP cap.
        let mut attempts = addrs.free();

        while self.outbound() < self.config.target_outbound_peers
            && self.total() < self.config.max_peers
            && attempts > 0
        {
            attempts -= 1;

            let Some(addr) = addrs.get_random_free(now) else {
                break;
            };
            if self.is_connected(&addr) || self.count_ip(&addr.ip()) >= self.config.max_peers_per_ip
            {
                continue;
            }
            if !addrs.mark_used(&addr) {
                continue;
            }
            self.connecting.insert(addr);
            dial.push(addr);
        }

        if !dial.is_empty() {
            debug!(
                target: "conn",
                "Dialing {} peer(s) ({}/{} outbound)",
                dial.len(),
                self.outbound(),
                self.config.target_outbound_peers
            );
        } else if self.outbound() < self.config.target_outbound_peers {
            debug!(target: "conn", "No free addresses to dial");
        }
        dial
    }

    /// A connection was established.
    pub fn peer_connected(&mut self, addr: PeerId, link: Link) -> Result<(), DisconnectReason> {
        self.connecting.remove(&addr);

        if self.connected.len() >= self.config.max_peers
            || self.count_ip(&addr.ip()) >= self.config.max_peers_per_ip
        {
            return Err(DisconnectReason::ConnectionLimit);
        }
        info!(target: "conn", "{}: Peer connected ({:?})", addr, link);

        self.connected.insert(
            addr,
            Peer {
                link,
                negotiated: false,
            },
        );
        Ok(())
    }

    /// A peer completed the handshake.
    pub fn peer_negotiated(&mut self, addr: &PeerId) {
        if let Some(peer) = self.connected.get_mut(addr) {
            peer.negotiated = true;
        }
    }

    /// Dialing an address failed.
    pub fn dial_failed(&mut self, addr: &PeerId, addrs: &mut AddressManager, now: LocalTime) {
        if self.connecting.remove(addr) {
            addrs.release(addr, true, now);
        }
    }

    /// A peer disconnected.
    ///
    /// Ban-worthy reasons ban the address. Otherwise the address is returned to
    /// the free bucket, with a backoff unless the peer negotiated and the
    /// disconnection wasn't its fault.
    pub fn peer_disconnected(
        &mut self,
        addr: &PeerId,
        reason: &DisconnectReason,
        addrs: &mut AddressManager,
        now: LocalTime,
    ) {
        self.connecting.remove(addr);

        let negotiated = self
            .connected
            .remove(addr)
            .map_or(false, |peer| peer.negotiated);

        info!(target: "conn", "{}: Peer disconnected: {}", addr, reason);

        if reason.is_banworthy() {
            addrs.ban(*addr, now);
        } else {
            let blameless = matches!(
                reason,
                DisconnectReason::ConnectionError(_) | DisconnectReason::Shutdown
            );
            addrs.release(addr, !(negotiated && blameless), now);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::ServiceFlags;

    fn addr(i: u8, port: u16) -> PeerId {
        ([55, 55, 55, i], port).into()
    }

    fn config() -> Config {
        Config {
            target_outbound_peers: 8,
            max_peers: 125,
            max_peers_per_ip: 5,
            connect_timeout: LocalDuration::from_secs(30),
        }
    }

    fn addrmgr() -> AddressManager {
        AddressManager::new(LocalDuration::from_mins(24 * 60), fastrand::Rng::with_seed(1))
    }

    #[test]
    fn test_maintain_target() {
        let time = LocalTime::from_secs(1_600_000_000);
        let mut addrs = addrmgr();
        let mut connmgr = ConnectionManager::new(config());

        for i in 0..20 {
            addrs.upsert(addr(i, 8333), ServiceFlags::NETWORK, 0);
        }
        let dial = connmgr.maintain(&mut addrs, time);
        assert_eq!(dial.len(), 8);
        assert_eq!(connmgr.outbound(), 8);
        assert_eq!(addrs.free(), 12);

        // Already at target.
        assert!(connmgr.maintain(&mut addrs, time).is_empty());

        connmgr.dial_failed(&dial[0], &mut addrs, time);
        assert_eq!(connmgr.outbound(), 7);
        assert_eq!(addrs.get(&dial[0]).unwrap().failures, 1);

        let redial = connmgr.maintain(&mut addrs, time);
        assert_eq!(redial.len(), 1);
        assert_ne!(redial[0], dial[0]);
    }

    #[test]
    fn test_max_peers() {
        let time = LocalTime::from_secs(1_600_000_000);
        let mut addrs = addrmgr();
        let mut connmgr = ConnectionManager::new(Config {
            max_peers: 3,
            ..config()
        });

        for i in 0..20 {
            addrs.upsert(addr(i, 8333), ServiceFlags::NETWORK, 0);
        }
        assert_eq!(connmgr.maintain(&mut addrs, time).len(), 3);
    }

    #[test]
    fn test_max_peers_per_ip() {
        let time = LocalTime::from_secs(1_600_000_000);
        let mut addrs = addrmgr();
        let mut connmgr = ConnectionManager::new(Config {
            max_peers_per_ip: 2,
            ..config()
        });

        for port in 0..10 {
            addrs.upsert(addr(1, 8000 + port), ServiceFlags::NETWORK, 0);
        }
        addrs.upsert(addr(2, 8333), ServiceFlags::NETWORK, 0);

        let dial = connmgr.maintain(&mut addrs, time);
        assert!(dial.len() <= 3);
        assert!(dial.iter().filter(|a| a.ip() == addr(1, 0).ip()).count() <= 2);
    }

    #[test]
    fn test_disconnect() {
        let time = LocalTime::from_secs(1_600_000_000);
        let mut addrs = addrmgr();
        let mut connmgr = ConnectionManager::new(config());

        for i in 0..3 {
            addrs.upsert(addr(i, 8333), ServiceFlags::NETWORK, 0);
        }
        let dial = connmgr.maintain(&mut addrs, time);
        assert_eq!(dial.len(), 3);

        for a in &dial {
            connmgr.peer_connected(*a, Link::Outbound).unwrap();
        }
        connmgr.peer_negotiated(&dial[1]);
        connmgr.peer_negotiated(&dial[2]);

        connmgr.peer_disconnected(
            &dial[0],
            &DisconnectReason::CheckpointMismatch(11111),
            &mut addrs,
            time,
        );
        assert!(addrs.is_banned(&dial[0]));

        connmgr.peer_disconnected(&dial[1], &DisconnectReason::PeerTooSlow, &mut addrs, time);
        assert_eq!(addrs.get(&dial[1]).unwrap().failures, 1);

        connmgr.peer_disconnected(
            &dial[2],
            &DisconnectReason::ConnectionError(String::from("reset")),
            &mut addrs,
            time,
        );
        assert_eq!(addrs.get(&dial[2]).unwrap().failures, 0);
        assert_eq!(addrs.get_random_free(time), Some(dial[2]));
        assert!(connmgr.is_empty());
    }
}
