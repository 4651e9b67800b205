//! Per-connection peer state machine.
//!
//! A [`Peer`] performs the version handshake, then downloads headers into the
//! chain service when told to by the sync manager. It also answers `ping` and
//! `getheaders`, and follows block announcements once the chain is current.
//!
//! The state machine does no I/O. Everything it wants done ends up in its
//! [`Outbox`].
use std::net;
use std::sync::{Arc, RwLock};

use log::*;

use headerchain_chain::block::checkpoints::{self, CheckpointGate};
use headerchain_chain::{AddOutcome, Broadcast, ChainService, HeaderAdded, Publisher};
use headerchain_common::block::store::Store;
use headerchain_common::block::time::{AdjustedTime, LocalDuration, LocalTime};
use headerchain_common::bitcoin_hashes::{sha256d, Hash};
use headerchain_common::block::{self, BlockHash, BlockHeader, BlockTime, Height};

use super::pingmgr::{self, Pinger};
use super::{Config, DisconnectReason, Link, Outbox, PeerId};
use super::{MAX_HEADERS, MIN_PROTOCOL_VERSION, REQUIRED_SERVICES};
use crate::wire::{
    Address, GetHeadersMessage, Inventory, NetworkMessage, Reject, RejectReason, ServiceFlags,
    VersionMessage,
};

/// Time a peer has to complete the handshake.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);

/// Network-adjusted clock, shared by all peers.
pub type Clock = Arc<RwLock<AdjustedTime<PeerId>>>;

/// Peer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Connection not yet established.
    Dialing,
    /// Our `version` was sent.
    HandshakeOurVersionSent,
    /// Their `version` was received, waiting for `verack`.
    HandshakeTheirVersionReceived,
    /// Their `verack` was received, waiting for `version`.
    HandshakeVerackReceived,
    /// Handshake complete.
    Ready,
    /// Downloading headers from this peer.
    Syncing,
    /// The peer had nothing more to offer.
    Idle,
    /// A disconnection was requested.
    Disconnecting,
}

impl State {
    /// Whether the handshake is complete and the peer wasn't disconnected.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Syncing | Self::Idle)
    }

    /// Whether the handshake is ongoing.
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::Dialing
                | Self::HandshakeOurVersionSent
                | Self::HandshakeTheirVersionReceived
                | Self::HandshakeVerackReceived
        )
    }
}

/// Events a peer reports to the sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The handshake completed.
    Negotiated {
        /// Peer's best height, as advertised.
        height: Height,
        /// Peer's services.
        services: ServiceFlags,
        /// Peer's user agent.
        user_agent: String,
        /// Negotiated protocol version.
        version: u32,
    },
    /// A `headers` message was processed.
    HeadersProcessed {
        /// Number of headers inserted.
        inserted: usize,
        /// Our tip height after processing.
        tip: Height,
    },
    /// The sync peer had no more headers to offer.
    Idle {
        /// Our tip height.
        tip: Height,
    },
    /// The peer advertised addresses.
    Addresses(Vec<(u32, Address)>),
}

/// Instructions for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start downloading headers from this peer.
    Sync,
    /// Disconnect the peer.
    Disconnect(DisconnectReason),
    /// Advance the clock.
    Tick,
}

/// What was negotiated during the handshake.
#[derive(Debug, Clone)]
struct Negotiated {
    version: u32,
    services: ServiceFlags,
    height: Height,
    user_agent: String,
}

/// A connected peer.
#[derive(Debug)]
pub struct Peer<S, P = Broadcast<HeaderAdded>> {
    /// Peer address.
    pub id: PeerId,
    /// Connection direction.
    pub link: Link,

    state: State,
    config: Config,
    chain: Arc<ChainService<S, P>>,
    checkpoints: Arc<CheckpointGate>,
    clock: Clock,
    negotiated: Option<Negotiated>,
    /// Nonce sent in our `version`.
    nonce: u64,
    /// Our tip when headers were last requested.
    requested_from: Option<BlockHash>,
    pinger: Pinger,
    connected_at: LocalTime,
    rng: fastrand::Rng,
    outbox: Outbox,
}

impl<S: Store, P: Publisher<HeaderAdded>> Peer<S, P> {
    /// Create a peer that is being dialed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PeerId,
        link: Link,
        config: Config,
        chain: Arc<ChainService<S, P>>,
        checkpoints: Arc<CheckpointGate>,
        clock: Clock,
        rng: fastrand::Rng,
        now: LocalTime,
    ) -> Self {
        let nonce = rng.u64(..);
        let pinger = Pinger::new(
            config.ping_interval,
            fastrand::Rng::with_seed(rng.u64(..)),
            now,
        );

        Self {
            id,
            link,
            state: State::Dialing,
            config,
            chain,
            checkpoints,
            clock,
            negotiated: None,
            nonce,
            requested_from: None,
            pinger,
            connected_at: now,
            rng,
            outbox: Outbox::new(id),
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Best height advertised by the peer, once known.
    pub fn height(&self) -> Option<Height> {
        self.negotiated.as_ref().map(|n| n.height)
    }

    /// Nonce of our `version` message.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Last measured ping round-trip time.
    pub fn latency(&self) -> Option<LocalDuration> {
        self.pinger.latency()
    }

    /// Outputs waiting to be carried out.
    pub fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// The connection was established.
    pub fn connected(&mut self, now: LocalTime) {
        if self.state != State::Dialing {
            return;
        }
        let version = self.version(now);

        self.connected_at = now;
        self.outbox.message(NetworkMessage::Version(version));
        self.state = State::HandshakeOurVersionSent;
    }

    /// Process a command.
    pub fn command(&mut self, cmd: Command, now: LocalTime) {
        match cmd {
            Command::Sync => {
                if !self.state.is_ready() {
                    debug!(target: "p2p", "{}: Not ready to sync ({:?})", self.id, self.state);
                    return;
                }
                self.state = State::Syncing;
                self.request_headers(None);
            }
            Command::Disconnect(reason) => self.disconnect(reason),
            Command::Tick => self.tick(now),
        }
    }

    /// Advance the clock.
    pub fn tick(&mut self, now: LocalTime) {
        if self.state.is_handshaking() {
            if now - self.connected_at >= HANDSHAKE_TIMEOUT {
                self.disconnect(DisconnectReason::PeerTimeout("handshake"));
            }
        } else if self.state.is_ready() {
            match self.pinger.tick(now) {
                pingmgr::Action::Ping(nonce) => self.outbox.message(NetworkMessage::Ping(nonce)),
                pingmgr::Action::Timeout => self.disconnect(DisconnectReason::PingTimeout),
                pingmgr::Action::None => {}
            }
        }
    }

    /// Process a message received from the peer.
    pub fn received(&mut self, msg: NetworkMessage, now: LocalTime) {
        if self.state == State::Disconnecting {
            return;
        }
        match msg {
            NetworkMessage::Version(version) => self.received_version(version, now),
            NetworkMessage::Verack => self.received_verack(now),
            msg if !self.state.is_ready() => {
                debug!(
                    target: "p2p",
                    "{}: Ignoring {:?} received during handshake", self.id, msg.cmd()
                );
            }
            NetworkMessage::Ping(nonce) => self.outbox.message(NetworkMessage::Pong(nonce)),
            NetworkMessage::Pong(nonce) => {
                if !self.pinger.received_pong(nonce, now) {
                    debug!(target: "p2p", "{}: Ignoring unsolicited pong", self.id);
                }
            }
            NetworkMessage::Headers(headers) => self.received_headers(headers),
            NetworkMessage::GetHeaders(msg) => self.received_getheaders(msg),
            NetworkMessage::Inv(inv) => self.received_inv(inv, now),
            NetworkMessage::Addr(addrs) => self.outbox.event(PeerEvent::Addresses(addrs)),
            NetworkMessage::Reject(reject) => {
                warn!(
                    target: "p2p",
                    "{}: Peer rejected our {:?}: {} ({:?})",
                    self.id, reject.message, reject.reason, reject.ccode
                );
            }
            msg => {
                trace!(target: "p2p", "{}: Ignoring {:?}", self.id, msg.cmd());
            }
        }
    }

    fn received_version(&mut self, version: VersionMessage, now: LocalTime) {
        if !matches!(
            self.state,
            State::HandshakeOurVersionSent | State::HandshakeVerackReceived
        ) {
            return self.disconnect(DisconnectReason::PeerMisbehaving(
                "unexpected `version` message received",
            ));
        }
        if version.nonce == self.nonce {
            return self.disconnect(DisconnectReason::SelfConnection);
        }
        // Peers older than this can't be trusted to follow the header exchange we
        // rely on.
        if version.version < MIN_PROTOCOL_VERSION {
            self.outbox.message(NetworkMessage::Reject(Reject {
                message: "version".into(),
                ccode: RejectReason::Obsolete,
                reason: format!("Version must be {} or greater", MIN_PROTOCOL_VERSION).into(),
                hash: sha256d::Hash::all_zeros(),
            }));
            return self.disconnect(DisconnectReason::PeerProtocolVersion(version.version));
        }
        // Peers that don't advertise the `NETWORK` service can't serve headers.
        if self.link.is_outbound() && !version.services.has(REQUIRED_SERVICES) {
            return self.disconnect(DisconnectReason::PeerServices(version.services));
        }
        // The timestamp is peer-controlled; don't let it overflow.
        let offset = version.timestamp.saturating_sub(now.as_secs() as i64);
        match self.clock.write() {
            Ok(mut clock) => clock.record_offset(self.id, offset),
            Err(poisoned) => poisoned.into_inner().record_offset(self.id, offset),
        }

        info!(
            target: "p2p",
            "{}: Peer version = {}, height = {}, agent = {}, services = {}, offset = {}s",
            self.id, version.version, version.start_height, version.user_agent, version.services, offset
        );

        self.negotiated = Some(Negotiated {
            version: version.version.min(self.config.protocol_version),
            services: version.services,
            height: version.start_height,
            user_agent: version.user_agent,
        });

        if self.state == State::HandshakeVerackReceived {
            self.ready(now);
        } else {
            self.state = State::HandshakeTheirVersionReceived;
        }
    }

    fn received_verack(&mut self, now: LocalTime) {
        match self.state {
            State::HandshakeOurVersionSent => self.state = State::HandshakeVerackReceived,
            State::HandshakeTheirVersionReceived => self.ready(now),
            _ => self.disconnect(DisconnectReason::PeerMisbehaving(
                "unexpected `verack` message received",
            )),
        }
    }

    fn ready(&mut self, now: LocalTime) {
        let Some(negotiated) = self.negotiated.clone() else {
            return;
        };
        self.state = State::Ready;
        self.pinger = Pinger::new(
            self.config.ping_interval,
            fastrand::Rng::with_seed(self.rng.u64(..)),
            now,
        );
        self.outbox.message(NetworkMessage::Verack);
        self.outbox.event(PeerEvent::Negotiated {
            height: negotiated.height,
            services: negotiated.services,
            user_agent: negotiated.user_agent,
            version: negotiated.version,
        });
        if self.link.is_outbound() {
            self.outbox.message(NetworkMessage::GetAddr);
        }
        info!(target: "p2p", "{}: Peer negotiated (version {})", self.id, negotiated.version);
    }

    fn received_headers(&mut self, headers: Vec<BlockHeader>) {
        let count = headers.len();

        if count > MAX_HEADERS {
            return self.disconnect(DisconnectReason::PeerMisbehaving("too many headers"));
        }
        if headers.is_empty() {
            if self.state == State::Syncing {
                let tip = self.tip_height();
                self.idle(tip);
            }
            return;
        }
        if headers
            .windows(2)
            .any(|pair| pair[1].prev_blockhash != pair[0].block_hash())
        {
            return self.disconnect(DisconnectReason::PeerMisbehaving("unconnected headers"));
        }
        debug!(target: "p2p", "{}: Received {} header(s)", self.id, count);

        let mut inserted = 0;
        for header in headers {
            let hash = header.block_hash();

            if !block::validate_pow(&header) {
                return self.disconnect(DisconnectReason::PeerMisbehaving("invalid proof of work"));
            }
            match self.check_checkpoint(&header, &hash) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(reason) => return self.disconnect(reason),
            }
            let (stored, outcome) = self.chain.add(header);

            match outcome {
                AddOutcome::Inserted => inserted += 1,
                AddOutcome::AlreadyExists => {}
                AddOutcome::Rejected => {
                    return self.disconnect(DisconnectReason::BlockRejected(hash));
                }
                AddOutcome::CreateFailed | AddOutcome::ChainUpdateFailed => {
                    warn!(
                        target: "p2p",
                        "{}: Header {} was not fully processed ({:?}, state = {:?})",
                        self.id, hash, outcome, stored.state
                    );
                }
            }
        }
        let tip = self.tip_height();

        self.outbox
            .event(PeerEvent::HeadersProcessed { inserted, tip });

        if inserted > 0 && (self.state == State::Syncing || count == MAX_HEADERS) {
            self.request_headers(None);
        } else if self.state == State::Syncing && self.tip_moved() {
            // Everything was known, but our tip moved since the request. Ask again
            // from where we are now.
            self.request_headers(None);
        } else if self.state == State::Syncing {
            self.idle(tip);
        }
    }

    /// Check a header against the checkpoint gate. Returns `false` if the header
    /// must not be stored.
    ///
    /// Orphans have no height to check, and adopting them later would place them
    /// without going through the gate. While checkpoints remain, they are dropped.
    fn check_checkpoint(
        &mut self,
        header: &BlockHeader,
        hash: &BlockHash,
    ) -> Result<bool, DisconnectReason> {
        let height = match self.chain.next_height(header) {
            Ok(Some(height)) => height,
            Ok(None) if self.checkpoints.is_complete() => return Ok(true),
            Ok(None) => {
                debug!(
                    target: "p2p",
                    "{}: Dropping unconnected header {} while checkpoints are pending", self.id, hash
                );
                return Ok(false);
            }
            Err(err) => {
                error!(target: "p2p", "{}: Failed to find height of {}: {}", self.id, hash, err);
                return Ok(true);
            }
        };

        match self.checkpoints.check(height, hash) {
            Ok(_) => Ok(true),
            Err(err @ checkpoints::Error::Mismatch { height, .. }) => {
                warn!(target: "p2p", "{}: {}", self.id, err);

                if let Err(err) = self.chain.reject(*hash) {
                    error!(target: "p2p", "{}: Failed to reject header {}: {}", self.id, hash, err);
                }
                Err(DisconnectReason::CheckpointMismatch(height))
            }
            Err(err @ checkpoints::Error::Skipped { checkpoint, .. }) => {
                warn!(target: "p2p", "{}: {}", self.id, err);

                Err(DisconnectReason::CheckpointSkipped(checkpoint))
            }
        }
    }

    fn received_getheaders(&mut self, msg: GetHeadersMessage) {
        match self
            .chain
            .locate_headers(&msg.locator_hashes, &msg.stop_hash, MAX_HEADERS)
        {
            Ok(headers) => {
                debug!(target: "p2p", "{}: Serving {} header(s)", self.id, headers.len());
                self.outbox.message(NetworkMessage::Headers(headers));
            }
            Err(err) => {
                error!(target: "p2p", "{}: Failed to locate headers: {}", self.id, err);
            }
        }
    }

    fn received_inv(&mut self, inv: Vec<Inventory>, now: LocalTime) {
        let Some(last) = inv.iter().rev().find_map(|i| match i {
            Inventory::Block(hash) => Some(*hash),
            _ => None,
        }) else {
            return;
        };
        let time = self.adjusted_time(now);

        match self.chain.is_current(self.checkpoints.highest(), time) {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: "p2p", "{}: Ignoring block announcement while syncing", self.id);
                return;
            }
            Err(err) => {
                error!(target: "p2p", "{}: Failed to read tip: {}", self.id, err);
                return;
            }
        }
        match self.chain.is_known(&last) {
            Ok(false) => self.request_headers(Some(last)),
            Ok(true) => {}
            Err(err) => error!(target: "p2p", "{}: Failed to look up {}: {}", self.id, last, err),
        }
    }

    /// Send a `getheaders` from our tip. Without a stop hash, stops at the next
    /// checkpoint, if any.
    fn request_headers(&mut self, stop: Option<BlockHash>) {
        let stop_hash = stop.unwrap_or_else(|| {
            self.checkpoints
                .next_checkpoint()
                .map_or_else(BlockHash::all_zeros, |(_, hash)| hash)
        });
        let locators = match self.chain.locator_hashes() {
            Ok(locators) => locators,
            Err(err) => {
                error!(target: "p2p", "{}: Failed to build locator: {}", self.id, err);
                return;
            }
        };
        let version = self
            .negotiated
            .as_ref()
            .map_or(self.config.protocol_version, |n| n.version);

        self.requested_from = locators.first().copied();
        self.outbox.message(NetworkMessage::GetHeaders(GetHeadersMessage {
            version,
            locator_hashes: locators,
            stop_hash,
        }));
    }

    /// Whether our tip changed since headers were last requested.
    fn tip_moved(&self) -> bool {
        match self.chain.tip() {
            Ok(tip) => tip.map(|t| t.hash) != self.requested_from,
            Err(err) => {
                error!(target: "p2p", "{}: Failed to read tip: {}", self.id, err);
                false
            }
        }
    }

    fn idle(&mut self, tip: Height) {
        info!(target: "p2p", "{}: Peer has no more headers (tip = {})", self.id, tip);

        self.state = State::Idle;
        self.outbox.event(PeerEvent::Idle { tip });
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state == State::Disconnecting {
            return;
        }
        self.state = State::Disconnecting;
        self.outbox.disconnect(reason);
    }

    fn tip_height(&self) -> Height {
        match self.chain.height() {
            Ok(height) => height,
            Err(err) => {
                error!(target: "p2p", "{}: Failed to read tip: {}", self.id, err);
                0
            }
        }
    }

    fn adjusted_time(&self, now: LocalTime) -> BlockTime {
        match self.clock.read() {
            Ok(clock) => clock.from(now),
            Err(poisoned) => poisoned.into_inner().from(now),
        }
    }

    fn version(&self, now: LocalTime) -> VersionMessage {
        VersionMessage {
            // Our max supported protocol version.
            version: self.config.protocol_version,
            // We serve nothing but headers.
            services: ServiceFlags::NONE,
            timestamp: now.as_secs() as i64,
            receiver: Address::new(&self.id, ServiceFlags::NONE),
            sender: Address::new(
                &net::SocketAddr::from(([0, 0, 0, 0], 0)),
                ServiceFlags::NONE,
            ),
            // A nonce to detect connections to self.
            nonce: self.nonce,
            user_agent: self.config.user_agent(),
            start_height: self.tip_height(),
            // We don't want transactions.
            relay: false,
        }
    }
}
