//! Message stream utilities.
use std::io;

use headerchain_common::bitcoin::consensus::encode;
use headerchain_common::network::Network;

use crate::wire::{self, NetworkMessage, RawNetworkMessage};

/// Message stream decoder.
///
/// Turns a byte stream into network messages. Frame headers are checked as soon as
/// they are readable, so a bad magic or an oversized payload is reported before the
/// payload arrives.
#[derive(Debug)]
pub struct Decoder {
    network: Network,
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(network: Network, capacity: usize) -> Self {
        Self {
            network,
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns [`None`] if nothing was decoded.
    pub fn decode_next(&mut self) -> Result<Option<NetworkMessage>, wire::Error> {
        wire::check_frame(&self.unparsed, self.network)?;

        match encode::deserialize_partial::<RawNetworkMessage>(&self.unparsed) {
            Ok((msg, index)) => {
                // Drain deserialized bytes only.
                self.unparsed.drain(..index);
                Ok(Some(msg.payload))
            }
            Err(encode::Error::Io(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
