//! Threaded network reactor.
//!
//! Every peer gets three threads: a reader that owns the peer state machine, a
//! writer that owns the write half of the socket, and a ticker that advances the
//! peer's clock. A single service thread owns the sync manager, the connection
//! manager and the address book, and talks to peers over channels only.
use std::collections::HashMap;
use std::io::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time;
use std::{io, net, thread};

use crossbeam_channel as chan;
use log::*;

use headerchain_chain::block::checkpoints::CheckpointGate;
use headerchain_chain::{Broadcast, ChainService, HeaderAdded, Publisher};
use headerchain_common::block::store::Store;
use headerchain_common::block::time::{LocalDuration, LocalTime};
use headerchain_common::dns::Seeds;
use headerchain_common::network::Network;

use crate::error::Error;
use crate::protocol::addrmgr::AddressManager;
use crate::protocol::connmgr::{self, ConnectionManager};
use crate::protocol::peer::{Clock, Command};
use crate::protocol::syncmgr::{self, SyncManager};
use crate::protocol::{Config, DisconnectReason, Link, Out, Peer, PeerEvent, PeerId};
use crate::protocol::REQUIRED_SERVICES;
use crate::stream::Decoder;
use crate::wire::{self, NetworkMessage};

/// Stack size for spawned threads, in bytes.
/// Since we're creating threads per peer, we want to keep the stack size small.
const THREAD_STACK_SIZE: usize = 1024 * 1024;

/// Size of the socket read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How often peers and the service are ticked. Also bounds how long a reader
/// blocks on its socket.
pub const TICK_INTERVAL: LocalDuration = LocalDuration::from_secs(1);

/// How long to wait for peers to disconnect on shutdown.
pub const SHUTDOWN_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);

/// Input to the service thread.
#[derive(Debug)]
enum Input {
    /// A dial succeeded.
    Connected(PeerId, net::TcpStream),
    /// A dial failed.
    DialFailed(PeerId, io::Error),
    /// Bytes were read from a peer.
    Received(PeerId, usize),
    /// A peer reported an event.
    Event(PeerId, PeerEvent),
    /// A peer's reader exited.
    Disconnected(PeerId, DisconnectReason),
}

/// Reader side of a peer connection. Owns the peer state machine.
struct Reader<S, P> {
    peer: Peer<S, P>,
    stream: net::TcpStream,
    decoder: Decoder,
    commands: chan::Receiver<Command>,
    writer: chan::Sender<NetworkMessage>,
    inputs: chan::Sender<Input>,
}

impl<S: Store, P: Publisher<HeaderAdded>> Reader<S, P> {
    /// Run until the peer is disconnected. Returns the reason.
    fn run(&mut self) -> DisconnectReason {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        self.peer.connected(LocalTime::now());

        loop {
            if let Err(reason) = self.step(&mut buf) {
                return reason;
            }
        }
    }

    fn step(&mut self, buf: &mut [u8]) -> Result<(), DisconnectReason> {
        self.flush()?;

        loop {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    self.peer.command(cmd, LocalTime::now());
                    self.flush()?;
                }
                Err(chan::TryRecvError::Empty) => break,
                Err(chan::TryRecvError::Disconnected) => return Err(DisconnectReason::Shutdown),
            }
        }

        let n = match self.stream.read(buf) {
            Ok(0) => {
                return Err(DisconnectReason::ConnectionError(String::from(
                    "connection closed by peer",
                )))
            }
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(())
            }
            Err(err) => return Err(DisconnectReason::ConnectionError(err.to_string())),
        };
        self.send(Input::Received(self.peer.id, n))?;
        self.decoder.input(&buf[..n]);

        loop {
            match self.decoder.decode_next() {
                Ok(Some(msg)) => {
                    trace!(target: "p2p", "{}: Received {:?}", self.peer.id, msg);

                    self.peer.received(msg, LocalTime::now());
                    self.flush()?;
                }
                Ok(None) => break,
                Err(err) if err.is_connection_error() => {
                    return Err(DisconnectReason::ConnectionError(err.to_string()))
                }
                Err(err) => return Err(DisconnectReason::Protocol(err.to_string())),
            }
        }
        Ok(())
    }

    /// Carry out the peer's outputs.
    fn flush(&mut self) -> Result<(), DisconnectReason> {
        let id = self.peer.id;

        for out in self.peer.outbox().drain() {
            match out {
                Out::Message(msg) => {
                    if self.writer.send(msg).is_err() {
                        return Err(DisconnectReason::ConnectionError(String::from(
                            "writer closed",
                        )));
                    }
                }
                Out::Event(event) => {
                    if self.inputs.send(Input::Event(id, event)).is_err() {
                        return Err(DisconnectReason::Shutdown);
                    }
                }
                Out::Disconnect(reason) => return Err(reason),
            }
        }
        Ok(())
    }

    fn send(&self, input: Input) -> Result<(), DisconnectReason> {
        self.inputs
            .send(input)
            .map_err(|_| DisconnectReason::Shutdown)
    }
}

/// Writer side of a peer connection.
struct Writer {
    id: PeerId,
    network: Network,
    stream: net::TcpStream,
}

impl Writer {
    /// Write messages until the channel closes or the socket fails, then shut the
    /// socket down.
    fn run(mut self, messages: chan::Receiver<NetworkMessage>) {
        for msg in messages.iter() {
            let cmd = msg.cmd();

            if let Err(err) = wire::write_message(&mut self.stream, msg, self.network) {
                debug!(target: "p2p", "{}: Write error: {}", self.id, err);
                break;
            }
            trace!(target: "p2p", "{}: Sent {:?}", self.id, cmd);
        }
        self.stream.shutdown(net::Shutdown::Both).ok();
    }
}

/// Send a tick to a peer every [`TICK_INTERVAL`], until its reader exits.
fn ticker(commands: chan::Sender<Command>) {
    loop {
        thread::sleep(TICK_INTERVAL.into());

        if commands.send(Command::Tick).is_err() {
            break;
        }
    }
}

fn spawn<F>(name: String, f: F) -> io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .stack_size(THREAD_STACK_SIZE)
        .spawn(f)
}

/// A connected peer, as seen by the service thread.
struct Connection {
    commands: chan::Sender<Command>,
    reader: thread::JoinHandle<()>,
}

/// Drives header synchronization over TCP.
#[derive(Debug)]
pub struct Reactor<S, P = Broadcast<HeaderAdded>> {
    config: Config,
    chain: Arc<ChainService<S, P>>,
    checkpoints: Arc<CheckpointGate>,
    clock: Clock,
    peers_file: Option<PathBuf>,
    rng: fastrand::Rng,
}

impl<S, P> Reactor<S, P>
where
    S: Store + 'static,
    P: Publisher<HeaderAdded> + 'static,
{
    /// Create a new reactor.
    pub fn new(
        config: Config,
        chain: Arc<ChainService<S, P>>,
        checkpoints: Arc<CheckpointGate>,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            chain,
            checkpoints,
            clock,
            peers_file: None,
            rng: fastrand::Rng::new(),
        }
    }

    /// Load known addresses from this file on startup, and save them on shutdown.
    pub fn peers_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.peers_file = Some(path.into());
        self
    }

    /// Run until a value is sent on `shutdown`, or its sender is dropped.
    ///
    /// `headers` should be subscribed to the chain's events, so that the sync
    /// manager tracks the tip.
    pub fn run(
        self,
        headers: chan::Receiver<HeaderAdded>,
        shutdown: chan::Receiver<()>,
    ) -> Result<(), Error> {
        let (inputs_tx, inputs) = chan::unbounded();
        let tip = self.chain.height()?;
        let mut service = Service {
            connmgr: ConnectionManager::new(connmgr::Config::from(&self.config)),
            syncmgr: SyncManager::new(
                syncmgr::Config {
                    min_speed: self.config.min_sync_peer_network_speed,
                },
                tip,
                fastrand::Rng::with_seed(self.rng.u64(..)),
            ),
            addrmgr: AddressManager::new(
                self.config.ban_duration,
                fastrand::Rng::with_seed(self.rng.u64(..)),
            ),
            peers: HashMap::new(),
            inputs: inputs_tx,
            reactor: self,
        };
        service.bootstrap();
        service.maintain(LocalTime::now());

        let ticks = chan::tick(TICK_INTERVAL.into());
        let mut headers = headers;
        let mut headers_closed = false;

        info!(target: "p2p", "Reactor started at height {}", tip);

        loop {
            chan::select! {
                recv(inputs) -> input => {
                    // The service holds a sender, so this can't fail.
                    if let Ok(input) = input {
                        service.handle(input, LocalTime::now());
                    }
                }
                recv(headers) -> event => match event {
                    Ok(event) => service.syncmgr.header_added(event.height),
                    Err(_) => headers_closed = true,
                },
                recv(ticks) -> _ => service.tick(LocalTime::now()),
                recv(shutdown) -> _ => break,
            }
            if headers_closed {
                headers = chan::never();
                headers_closed = false;
            }
            service.dispatch();
        }
        service.shutdown(&inputs);

        Ok(())
    }
}

/// State owned by the service thread.
struct Service<S, P> {
    reactor: Reactor<S, P>,
    connmgr: ConnectionManager,
    syncmgr: SyncManager,
    addrmgr: AddressManager,
    peers: HashMap<PeerId, Connection>,
    inputs: chan::Sender<Input>,
}

impl<S, P> Service<S, P>
where
    S: Store + 'static,
    P: Publisher<HeaderAdded> + 'static,
{
    /// Fill the address book.
    fn bootstrap(&mut self) {
        if let Some(path) = &self.reactor.peers_file {
            match self.addrmgr.load(path) {
                Ok(n) => info!(target: "p2p", "Loaded {} address(es) from {}", n, path.display()),
                Err(err) => warn!(target: "p2p", "Failed to load {}: {}", path.display(), err),
            }
        }
        let config = &self.reactor.config;

        if !config.connect.is_empty() {
            for addr in &config.connect {
                self.addrmgr.upsert(*addr, REQUIRED_SERVICES, 0);
            }
        } else if self.addrmgr.free() == 0 {
            let seeds = Seeds::from_network(&config.network).resolve();

            info!(target: "p2p", "Resolved {} address(es) from DNS seeds", seeds.len());

            for addr in seeds {
                self.addrmgr.upsert(addr, REQUIRED_SERVICES, 0);
            }
        }
    }

    fn handle(&mut self, input: Input, now: LocalTime) {
        match input {
            Input::Connected(addr, stream) => self.connected(addr, stream, now),
            Input::DialFailed(addr, err) => {
                debug!(target: "conn", "{}: Dial failed: {}", addr, err);

                self.connmgr.dial_failed(&addr, &mut self.addrmgr, now);
                self.maintain(now);
            }
            Input::Received(addr, n) => self.syncmgr.received_bytes(&addr, n),
            Input::Event(addr, event) => {
                match &event {
                    PeerEvent::Negotiated { .. } => self.connmgr.peer_negotiated(&addr),
                    PeerEvent::Addresses(addrs) if self.reactor.config.connect.is_empty() => {
                        for (time, addr) in addrs {
                            if let Ok(sock) = addr.socket_addr() {
                                self.addrmgr.upsert(sock, addr.services, *time);
                            }
                        }
                    }
                    _ => {}
                }
                self.syncmgr.received_event(addr, event, now);
            }
            Input::Disconnected(addr, reason) => {
                self.disconnected(addr, reason, now);
                self.maintain(now);
            }
        }
    }

    fn tick(&mut self, now: LocalTime) {
        self.syncmgr.tick(now);
        self.addrmgr.tick(now);
        self.maintain(now);
    }

    /// Forward the sync manager's commands to peers.
    fn dispatch(&mut self) {
        for (addr, cmd) in self.syncmgr.drain() {
            if let Some(conn) = self.peers.get(&addr) {
                conn.commands.send(cmd).ok();
            }
        }
    }

    /// Dial peers until outbound connections reach the target.
    fn maintain(&mut self, now: LocalTime) {
        for addr in self.connmgr.maintain(&mut self.addrmgr, now) {
            self.dial(addr, now);
        }
    }

    fn dial(&mut self, addr: PeerId, now: LocalTime) {
        let inputs = self.inputs.clone();
        let timeout: time::Duration = self.connmgr.connect_timeout().into();

        debug!(target: "conn", "{}: Dialing..", addr);

        let result = spawn(format!("dial {}", addr), move || {
            let input = match net::TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => Input::Connected(addr, stream),
                Err(err) => Input::DialFailed(addr, err),
            };
            inputs.send(input).ok();
        });
        if let Err(err) = result {
            error!(target: "conn", "{}: Failed to spawn dialer: {}", addr, err);
            self.connmgr.dial_failed(&addr, &mut self.addrmgr, now);
        }
    }

    fn connected(&mut self, addr: PeerId, stream: net::TcpStream, now: LocalTime) {
        if let Err(reason) = self.connmgr.peer_connected(addr, Link::Outbound) {
            stream.shutdown(net::Shutdown::Both).ok();
            self.connmgr
                .peer_disconnected(&addr, &reason, &mut self.addrmgr, now);
            return;
        }
        if let Err(err) = self.spawn_peer(addr, stream, now) {
            let reason = DisconnectReason::ConnectionError(err.to_string());
            self.connmgr
                .peer_disconnected(&addr, &reason, &mut self.addrmgr, now);
        }
    }

    fn spawn_peer(&mut self, addr: PeerId, stream: net::TcpStream, now: LocalTime) -> io::Result<()> {
        let reactor = &self.reactor;
        let network = reactor.config.network;

        stream.set_read_timeout(Some(TICK_INTERVAL.into()))?;
        stream.set_write_timeout(Some(reactor.config.connect_timeout.into()))?;
        stream.set_nodelay(true)?;

        let (commands_tx, commands_rx) = chan::unbounded();
        let (writer_tx, writer_rx) = chan::unbounded();
        let writer = Writer {
            id: addr,
            network,
            stream: stream.try_clone()?,
        };
        let mut reader = Reader {
            peer: Peer::new(
                addr,
                Link::Outbound,
                reactor.config.clone(),
                reactor.chain.clone(),
                reactor.checkpoints.clone(),
                reactor.clock.clone(),
                fastrand::Rng::with_seed(reactor.rng.u64(..)),
                now,
            ),
            stream,
            decoder: Decoder::new(network, READ_BUFFER_SIZE),
            commands: commands_rx,
            writer: writer_tx,
            inputs: self.inputs.clone(),
        };

        spawn(format!("writer {}", addr), move || writer.run(writer_rx))?;

        let ticks = commands_tx.clone();
        spawn(format!("ticker {}", addr), move || ticker(ticks))?;

        let handle = spawn(format!("reader {}", addr), move || {
            let reason = reader.run();
            let id = reader.peer.id;
            let inputs = reader.inputs.clone();

            // Closes the writer, which then shuts the socket down.
            drop(reader);
            inputs.send(Input::Disconnected(id, reason)).ok();
        })?;

        self.peers.insert(
            addr,
            Connection {
                commands: commands_tx,
                reader: handle,
            },
        );
        Ok(())
    }

    fn disconnected(&mut self, addr: PeerId, reason: DisconnectReason, now: LocalTime) {
        if let Some(conn) = self.peers.remove(&addr) {
            if conn.reader.join().is_err() {
                error!(target: "p2p", "{}: Reader thread panicked", addr);
            }
        }
        self.connmgr
            .peer_disconnected(&addr, &reason, &mut self.addrmgr, now);
        self.syncmgr.peer_disconnected(&addr, now);
    }

    /// Disconnect every peer, then persist the address book and flush the store.
    fn shutdown(mut self, inputs: &chan::Receiver<Input>) {
        info!(target: "p2p", "Shutting down {} peer(s)..", self.peers.len());

        for conn in self.peers.values() {
            conn.commands
                .send(Command::Disconnect(DisconnectReason::Shutdown))
                .ok();
        }
        let deadline = time::Instant::now() + time::Duration::from(SHUTDOWN_TIMEOUT);

        while !self.peers.is_empty() {
            match inputs.recv_deadline(deadline) {
                Ok(Input::Disconnected(addr, reason)) => {
                    self.disconnected(addr, reason, LocalTime::now())
                }
                Ok(Input::Connected(_, stream)) => {
                    stream.shutdown(net::Shutdown::Both).ok();
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        target: "p2p",
                        "Timed out waiting for {} peer(s) to disconnect",
                        self.peers.len()
                    );
                    break;
                }
            }
        }

        if let Some(path) = &self.reactor.peers_file {
            match self.addrmgr.save(path) {
                Ok(()) => debug!(target: "p2p", "Saved {} address(es) to {}", self.addrmgr.len(), path.display()),
                Err(err) => error!(target: "p2p", "Failed to save {}: {}", path.display(), err),
            }
        }
        if let Err(err) = self.reactor.chain.store().sync() {
            error!(target: "p2p", "Failed to flush header store: {}", err);
        }
    }
}
