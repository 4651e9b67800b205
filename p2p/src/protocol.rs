//! Header synchronization protocol.
//!
//! Every component here is a state machine without I/O: inputs are messages,
//! commands and clock ticks, outputs are queued in an [`output::Outbox`] for the
//! reactor to carry out.
#![warn(missing_docs)]
pub mod addrmgr;
pub mod connmgr;
pub mod output;
pub mod peer;
pub mod pingmgr;
pub mod syncmgr;

use std::fmt;
use std::net;

use headerchain_common::block::time::LocalDuration;
use headerchain_common::block::{BlockHash, Height};
use headerchain_common::network::Network;

use crate::wire::ServiceFlags;

pub use output::{Out, Outbox};
pub use peer::{Peer, PeerEvent};

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70015;
/// Minimum protocol version accepted from peers.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
/// Services we require from peers: a full node.
pub const REQUIRED_SERVICES: ServiceFlags = ServiceFlags::NETWORK;
/// Maximum number of headers in a `headers` message.
pub const MAX_HEADERS: usize = 2000;

/// Identifies a peer.
pub type PeerId = net::SocketAddr;

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound connection.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }
}

/// Disconnect reason.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer sent a malformed message.
    Protocol(String),
    /// Peer protocol version is too old.
    PeerProtocolVersion(u32),
    /// Peer doesn't offer the services we need.
    PeerServices(ServiceFlags),
    /// Peer timed out.
    PeerTimeout(&'static str),
    /// Peer didn't answer our pings.
    PingTimeout,
    /// Peer is too slow to sync from.
    PeerTooSlow,
    /// Peer sent a header that doesn't match a checkpoint.
    CheckpointMismatch(Height),
    /// Peer sent headers past a checkpoint without going through it.
    CheckpointSkipped(Height),
    /// Peer sent a rejected header.
    BlockRejected(BlockHash),
    /// Connection to self was detected.
    SelfConnection,
    /// Connection limit reached.
    ConnectionLimit,
    /// Error with the underlying connection.
    ConnectionError(String),
    /// The node is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Check whether the disconnect reason is transient, ie. may no longer be applicable
    /// after some time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLimit
                | Self::PeerTimeout(_)
                | Self::PingTimeout
                | Self::PeerTooSlow
                | Self::ConnectionError(_)
                | Self::Shutdown
        )
    }

    /// Check whether the peer should be banned for this.
    pub fn is_banworthy(&self) -> bool {
        matches!(
            self,
            Self::PeerMisbehaving(_)
                | Self::Protocol(_)
                | Self::CheckpointMismatch(_)
                | Self::CheckpointSkipped(_)
                | Self::BlockRejected(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::Protocol(err) => write!(f, "protocol error: {}", err),
            Self::PeerProtocolVersion(v) => write!(f, "peer protocol version {} is too old", v),
            Self::PeerServices(s) => write!(f, "peer doesn't offer required services: {}", s),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {:?}", s),
            Self::PingTimeout => write!(f, "peer didn't respond to ping"),
            Self::PeerTooSlow => write!(f, "peer is too slow"),
            Self::CheckpointMismatch(h) => write!(f, "checkpoint mismatch at height {}", h),
            Self::CheckpointSkipped(h) => write!(f, "checkpoint at height {} skipped", h),
            Self::BlockRejected(hash) => write!(f, "block {} rejected", hash),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
            Self::ConnectionError(err) => write!(f, "connection error: {}", err),
            Self::Shutdown => write!(f, "shutting down"),
        }
    }
}

/// Protocol configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network to connect to.
    pub network: Network,
    /// Peers to connect to. When not empty, DNS seeds aren't used.
    pub connect: Vec<net::SocketAddr>,
    /// How long a banned peer stays banned.
    pub ban_duration: LocalDuration,
    /// Whether to skip the checkpoint gate.
    pub disable_checkpoints: bool,
    /// Unused; kept for configuration compatibility.
    pub blocks_for_fork_confirmation: Height,
    /// TCP dial timeout.
    pub connect_timeout: LocalDuration,
    /// Maximum number of peers.
    pub max_peers: usize,
    /// Maximum number of peers sharing an IP.
    pub max_peers_per_ip: usize,
    /// Minimum sync peer speed, in bytes per second.
    pub min_sync_peer_network_speed: u64,
    /// Number of outbound peers to maintain.
    pub target_outbound_peers: usize,
    /// Excessive block size advertised in the user agent, in bytes.
    pub excessive_block_size: u64,
    /// Time between pings.
    pub ping_interval: LocalDuration,
    /// Our protocol version.
    pub protocol_version: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            connect: Vec::new(),
            ban_duration: LocalDuration::from_mins(24 * 60),
            disable_checkpoints: false,
            blocks_for_fork_confirmation: 10,
            connect_timeout: LocalDuration::from_secs(30),
            max_peers: 125,
            max_peers_per_ip: 5,
            min_sync_peer_network_speed: 51200,
            target_outbound_peers: 8,
            excessive_block_size: 128_000_000,
            ping_interval: LocalDuration::from_mins(2),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl Config {
    /// The user agent sent in `version` messages.
    pub fn user_agent(&self) -> String {
        let tenths = self.excessive_block_size / 100_000;

        format!(
            "/headerchain:{}/EB{}.{}/",
            env!("CARGO_PKG_VERSION"),
            tenths / 10,
            tenths % 10
        )
    }
}
