//! Peer-to-peer header synchronization.
//!
//! The protocol logic lives under [protocol](crate::protocol), split into:
//!
//! * [`Peer`][peer]: per-connection handshake and header download
//! * [`SyncManager`][syncmgr]: sync peer selection and speed checks
//! * [`ConnectionManager`][connmgr]: outbound connection targets and caps
//! * [`AddressManager`][addrmgr]: known addresses, bans and retry backoff
//! * [`Pinger`][pingmgr]: pings and pongs
//!
//! [peer]: crate::protocol::peer::Peer
//! [syncmgr]: crate::protocol::syncmgr::SyncManager
//! [connmgr]: crate::protocol::connmgr::ConnectionManager
//! [addrmgr]: crate::protocol::addrmgr::AddressManager
//! [pingmgr]: crate::protocol::pingmgr::Pinger
//!
//! None of these do I/O. They consume messages, commands and clock ticks, and
//! produce outputs. Sockets, threads and timers are handled by the
//! [reactor](crate::reactor), which translates network events into protocol
//! inputs and carries out protocol outputs.
//!
//! For example, when a `ping` is received:
//!
//! 1. A peer's reader thread reads bytes from the socket and decodes a
//!    `NetworkMessage::Ping`.
//! 2. It hands the message to the peer's state machine with the current time.
//! 3. The state machine queues `Out::Message(NetworkMessage::Pong(nonce))`.
//! 4. The reader forwards the message to the peer's writer thread, which encodes
//!    and writes it to the socket.
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]
#![deny(missing_docs, unsafe_code)]
pub mod error;
pub mod protocol;
pub mod reactor;
pub mod stream;
pub mod wire;

pub use error::Error;
pub use protocol::{Config, DisconnectReason, PeerId};
pub use reactor::Reactor;
