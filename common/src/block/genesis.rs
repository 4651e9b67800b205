//! Genesis block headers.
use bitcoin_hashes::Hash;

use super::{BlockHash, BlockHeader, MerkleRoot};

/// Merkle root of the genesis coinbase, shared by all networks. Internal byte order.
const GENESIS_MERKLE_ROOT: [u8; 32] = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
];

fn genesis(time: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: MerkleRoot::from_inner(GENESIS_MERKLE_ROOT),
        time,
        bits,
        nonce,
    }
}

/// Mainnet genesis header.
pub fn mainnet() -> BlockHeader {
    genesis(1231006505, 0x1d00ffff, 2083236893)
}

/// Testnet genesis header.
pub fn testnet() -> BlockHeader {
    genesis(1296688602, 0x1d00ffff, 414098458)
}

/// Regtest genesis header.
pub fn regtest() -> BlockHeader {
    genesis(1296688602, 0x207fffff, 2)
}

/// Simnet genesis header.
pub fn simnet() -> BlockHeader {
    genesis(1401292357, 0x207fffff, 2)
}
