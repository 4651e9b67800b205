//! Wire framing.
//!
//! Messages are the `bitcoin` crate's [`RawNetworkMessage`]: `magic (4) | command (12) |
//! payload length (4) | checksum (4) | payload`. The crate verifies checksums and
//! decodes payloads; the magic and the payload size are checked here, as soon as
//! they are readable.
use std::io;

use thiserror::Error;

use headerchain_common::bitcoin::consensus::encode;
use headerchain_common::network::Network;

pub use headerchain_common::bitcoin::network::address::Address;
pub use headerchain_common::bitcoin::network::constants::ServiceFlags;
pub use headerchain_common::bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
pub use headerchain_common::bitcoin::network::message_blockdata::{GetHeadersMessage, Inventory};
pub use headerchain_common::bitcoin::network::message_network::{
    Reject, RejectReason, VersionMessage,
};

/// Size of a frame header.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Maximum payload size accepted.
pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1000 * 1000;

/// A wire error.
#[derive(Debug, Error)]
pub enum Error {
    /// The frame is for another network.
    #[error("invalid magic {0:#010x}")]
    InvalidMagic(u32),
    /// The payload exceeds the maximum size.
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(u32),
    /// The message could not be decoded, or failed its checksum.
    #[error("encoding error: {0}")]
    Encoding(#[from] encode::Error),
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error is caused by the connection rather than by the peer.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Encoding(encode::Error::Io(_)))
    }
}

/// Check the readable part of a frame header: the magic, then the payload length.
pub fn check_frame(bytes: &[u8], network: Network) -> Result<(), Error> {
    if let Some(b) = bytes.get(..4) {
        let magic = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);

        if magic != network.magic() {
            return Err(Error::InvalidMagic(magic));
        }
    }
    if let Some(b) = bytes.get(16..20) {
        let len = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);

        if len > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(len));
        }
    }
    Ok(())
}

/// Encode a message with its frame.
pub fn encode(payload: NetworkMessage, network: Network) -> Vec<u8> {
    encode::serialize(&RawNetworkMessage {
        magic: network.magic(),
        payload,
    })
}

/// Read one message from a reader.
pub fn read_message<R: io::Read + ?Sized>(
    reader: &mut R,
    network: Network,
) -> Result<NetworkMessage, Error> {
    let mut buf = vec![0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut buf)?;
    check_frame(&buf, network)?;

    let len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
    buf.resize(FRAME_HEADER_SIZE + len, 0);
    reader.read_exact(&mut buf[FRAME_HEADER_SIZE..])?;

    let raw: RawNetworkMessage = encode::deserialize(&buf)?;

    Ok(raw.payload)
}

/// Write one message to a writer. Returns the number of bytes written.
pub fn write_message<W: io::Write + ?Sized>(
    writer: &mut W,
    message: NetworkMessage,
    network: Network,
) -> Result<usize, Error> {
    let bytes = encode(message, network);
    writer.write_all(&bytes)?;

    Ok(bytes.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use headerchain_common::bitcoin_hashes::{sha256d, Hash};
    use headerchain_common::block::{genesis, BlockHash};

    /// A regtest `verack`.
    const MSG_VERACK: [u8; 24] = [
        0xfa, 0xbf, 0xb5, 0xda, 0x76, 0x65, 0x72, 0x61, 0x63, 0x6b, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x5d, 0xf6, 0xe0, 0xe2,
    ];

    #[test]
    fn test_verack_bytes() {
        assert_eq!(encode(NetworkMessage::Verack, Network::Regtest), MSG_VERACK);
        assert_eq!(
            read_message(&mut &MSG_VERACK[..], Network::Regtest).unwrap(),
            NetworkMessage::Verack
        );
    }

    #[test]
    fn test_read_sequence() {
        let msgs = vec![
            NetworkMessage::Ping(100),
            NetworkMessage::Headers(vec![genesis::mainnet(), genesis::testnet()]),
            NetworkMessage::GetHeaders(GetHeadersMessage {
                version: 70015,
                locator_hashes: vec![genesis::mainnet().block_hash()],
                stop_hash: BlockHash::all_zeros(),
            }),
        ];
        let mut buf = Vec::new();

        for msg in &msgs {
            write_message(&mut buf, msg.clone(), Network::Mainnet).unwrap();
        }
        let mut reader = &buf[..];
        for msg in msgs {
            assert_eq!(read_message(&mut reader, Network::Mainnet).unwrap(), msg);
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn test_invalid_magic() {
        let bytes = encode(NetworkMessage::Verack, Network::Testnet);

        assert!(matches!(
            read_message(&mut &bytes[..], Network::Mainnet),
            Err(Error::InvalidMagic(0x0709110b))
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let mut bytes = encode(NetworkMessage::Verack, Network::Mainnet);
        bytes[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());

        assert!(matches!(
            read_message(&mut &bytes[..], Network::Mainnet),
            Err(Error::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_invalid_checksum() {
        let mut bytes = encode(NetworkMessage::Ping(7), Network::Mainnet);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert!(matches!(
            read_message(&mut &bytes[..], Network::Mainnet),
            Err(Error::Encoding(encode::Error::InvalidChecksum { .. }))
        ));
    }

    #[test]
    fn test_headers_with_transactions() {
        let mut bytes = encode(
            NetworkMessage::Headers(vec![genesis::mainnet()]),
            Network::Mainnet,
        );
        // The transaction count follows each header.
        let last = bytes.len() - 1;
        bytes[last] = 1;

        let checksum = sha256d::Hash::hash(&bytes[FRAME_HEADER_SIZE..]).into_inner();
        bytes[20..24].copy_from_slice(&checksum[..4]);

        let err = read_message(&mut &bytes[..], Network::Mainnet).unwrap_err();

        assert!(matches!(err, Error::Encoding(_)));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_truncated() {
        let bytes = encode(NetworkMessage::Ping(7), Network::Mainnet);
        let err = read_message(&mut &bytes[..bytes.len() - 1], Network::Mainnet).unwrap_err();

        assert!(err.is_connection_error());
    }
}
