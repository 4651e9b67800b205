//! Merkle root confirmation for light clients.
use std::fmt;
use std::str::FromStr;

use headerchain_common::block::store::{self, Store};
use headerchain_common::bitcoin_hashes::hex;
use headerchain_common::block::{BlockHash, Height, MerkleRoot};

/// Default number of heights past the tip for which a request is reported as
/// unverifiable rather than invalid.
pub const DEFAULT_MAX_EXCESS: Height = 6;

/// A request to confirm that a merkle root is in the longest chain at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleRootRequest {
    /// Merkle root.
    pub merkle_root: MerkleRoot,
    /// Block height.
    pub height: Height,
}

impl MerkleRootRequest {
    /// Create a request from a merkle root in its hex form.
    pub fn from_hex(merkle_root: &str, height: Height) -> Result<Self, hex::Error> {
        Ok(Self {
            merkle_root: MerkleRoot::from_str(merkle_root)?,
            height,
        })
    }
}

/// Result of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The merkle root is in the longest chain, in the header with the given hash.
    Confirmed(BlockHash),
    /// The merkle root is not in the longest chain at that height.
    Invalid,
    /// The height is slightly above the tip. The header may not have arrived yet.
    UnableToVerify,
}

impl fmt::Display for Confirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(hash) => write!(f, "confirmed ({})", hash),
            Self::Invalid => write!(f, "invalid"),
            Self::UnableToVerify => write!(f, "unable to verify"),
        }
    }
}

/// Confirm each request against the store.
pub fn confirm<S: Store + ?Sized>(
    store: &S,
    requests: &[MerkleRootRequest],
    max_excess: Height,
) -> Result<Vec<Confirmation>, store::Error> {
    let tip = store.height()?;
    let mut confirmations = Vec::with_capacity(requests.len());

    for req in requests {
        let confirmation = if req.height > tip.saturating_add(max_excess) {
            Confirmation::Invalid
        } else if req.height > tip {
            Confirmation::UnableToVerify
        } else {
            match store.merkle_root_confirmation(&req.merkle_root, req.height, tip)? {
                Some(header) => Confirmation::Confirmed(header.hash),
                None => Confirmation::Invalid,
            }
        };
        confirmations.push(confirmation);
    }
    Ok(confirmations)
}
