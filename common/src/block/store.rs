//! Header repository interface.
#![allow(clippy::len_without_is_empty)]
use std::fmt;
use std::io;

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin_hashes::Hash as _;
use thiserror::Error;

use super::work::{self, Work};
use super::{BlockHash, BlockHeader, Height, MerkleRoot};

/// A repository error.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Stored data could not be decoded.
    #[error("error decoding header: {0}")]
    Decoding(#[from] encode::Error),
    /// The store data is corrupt.
    #[error("error: the store data is corrupt")]
    Corruption,
    /// A write would break a repository invariant. Nothing was written.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A header referenced by a write does not exist.
    #[error("header {0} not found")]
    NotFound(BlockHash),
    /// An internal lock was poisoned.
    #[error("store lock poisoned")]
    Poisoned,
}

impl Error {
    /// Whether the error is transient, ie. the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// State of a stored header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderState {
    /// Part of the longest chain.
    Longest,
    /// Valid, but not on the longest chain.
    Stale,
    /// Parent unknown.
    Orphan,
    /// Rejected; never a parent.
    Rejected,
}

impl HeaderState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Longest => 0,
            Self::Stale => 1,
            Self::Orphan => 2,
            Self::Rejected => 3,
        }
    }
}

impl fmt::Display for HeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Longest => write!(f, "longest"),
            Self::Stale => write!(f, "stale"),
            Self::Orphan => write!(f, "orphan"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl Encodable for HeaderState {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_u8().consensus_encode(writer)
    }
}

impl Decodable for HeaderState {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        match u8::consensus_decode(reader)? {
            0 => Ok(Self::Longest),
            1 => Ok(Self::Stale),
            2 => Ok(Self::Orphan),
            3 => Ok(Self::Rejected),
            _ => Err(encode::Error::ParseFailed("unknown header state")),
        }
    }
}

/// A header as stored in the repository, with its derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHeader {
    /// Header hash.
    pub hash: BlockHash,
    /// Header height. Zero for orphans.
    pub height: Height,
    /// The wire header.
    pub header: BlockHeader,
    /// Current state.
    pub state: HeaderState,
    /// Work of this header alone.
    pub chainwork: Work,
    /// Total work of the chain ending at this header. Zero for orphans.
    pub cumulated_work: Work,
}

impl StoredHeader {
    /// Build a stored header from a wire header and its computed position.
    pub fn new(
        header: BlockHeader,
        height: Height,
        state: HeaderState,
        cumulated_work: Work,
    ) -> Self {
        Self {
            hash: header.block_hash(),
            height,
            header,
            state,
            chainwork: work::work(header.bits),
            cumulated_work,
        }
    }

    /// The stored form of a genesis header.
    pub fn genesis(header: BlockHeader) -> Self {
        Self::new(header, 0, HeaderState::Longest, work::work(header.bits))
    }

    /// A rejected record. Only the hash and state are meaningful.
    pub fn rejected(hash: BlockHash) -> Self {
        Self {
            hash,
            height: 0,
            header: BlockHeader {
                version: 0,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: MerkleRoot::all_zeros(),
                time: 0,
                bits: 0,
                nonce: 0,
            },
            state: HeaderState::Rejected,
            chainwork: Work::zero(),
            cumulated_work: Work::zero(),
        }
    }
}

impl std::ops::Deref for StoredHeader {
    type Target = BlockHeader;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

impl Encodable for StoredHeader {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;

        len += self.hash.consensus_encode(writer)?;
        len += self.height.consensus_encode(writer)?;
        len += self.header.consensus_encode(writer)?;
        len += self.state.consensus_encode(writer)?;
        len += work::to_bytes(&self.chainwork).consensus_encode(writer)?;
        len += work::to_bytes(&self.cumulated_work).consensus_encode(writer)?;

        Ok(len)
    }
}

impl Decodable for StoredHeader {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        Ok(Self {
            hash: Decodable::consensus_decode(reader)?,
            height: Decodable::consensus_decode(reader)?,
            header: Decodable::consensus_decode(reader)?,
            state: Decodable::consensus_decode(reader)?,
            chainwork: work::from_bytes(&Decodable::consensus_decode(reader)?),
            cumulated_work: work::from_bytes(&Decodable::consensus_decode(reader)?),
        })
    }
}

/// Result of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// The header was inserted.
    Inserted,
    /// A header with the same hash was already stored. Nothing changed.
    AlreadyExists,
}

/// Represents objects that can store and query block headers.
///
/// Implementations serialize writes internally and allow concurrent reads. Every
/// write is a transaction: it either applies fully or not at all. Lookups that find
/// nothing return `None` rather than an error.
pub trait Store: Send + Sync {
    /// Insert a header. Idempotent on the header hash.
    fn create(&self, header: StoredHeader) -> Result<Created, Error>;
    /// Insert a batch of headers, all-or-nothing. Already stored hashes are skipped.
    /// Returns the number of headers inserted.
    fn create_batch(&self, headers: Vec<StoredHeader>) -> Result<usize, Error>;
    /// Set the state of the given headers.
    fn update_state(&self, hashes: &[BlockHash], state: HeaderState) -> Result<(), Error>;
    /// Move `stale` out of, and `longest` into, the longest chain, in one transaction.
    fn switch_branch(&self, stale: &[BlockHash], longest: &[BlockHash]) -> Result<(), Error>;
    /// Replace an orphan record with its adopted form.
    fn adopt(&self, header: StoredHeader) -> Result<(), Error>;
    /// Get a header by hash.
    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, Error>;
    /// Get the header at the given height and state. Orphan and rejected headers
    /// carry no meaningful height and are never returned.
    fn get_by_height_in_state(
        &self,
        height: Height,
        state: HeaderState,
    ) -> Result<Option<StoredHeader>, Error>;
    /// Get all longest and stale headers in the inclusive height range, ascending.
    fn get_by_height_range(&self, from: Height, to: Height) -> Result<Vec<StoredHeader>, Error>;
    /// Longest-chain headers from the given height upwards, ascending.
    fn longest_chain_from(&self, height: Height) -> Result<Vec<StoredHeader>, Error>;
    /// Follow `prev_block` from `hash` while headers are stale. Descending.
    fn stale_chain_back_from(&self, hash: &BlockHash) -> Result<Vec<StoredHeader>, Error>;
    /// The parent of the given header.
    fn previous(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, Error>;
    /// Longest-chain header with maximum height.
    fn tip(&self) -> Result<Option<StoredHeader>, Error>;
    /// The longest tip, plus every non-longest header that is nobody's parent.
    fn all_tips(&self) -> Result<Vec<StoredHeader>, Error>;
    /// Walk back from `hash` until reaching the given height.
    fn ancestor_on_height(
        &self,
        hash: &BlockHash,
        height: Height,
    ) -> Result<Option<StoredHeader>, Error>;
    /// Ancestors of `high` down to and including `low`, ascending. Empty if `low`
    /// is not an ancestor of `high`.
    fn chain_between(&self, low: &BlockHash, high: &BlockHash)
        -> Result<Vec<StoredHeader>, Error>;
    /// Orphans whose parent is the given hash.
    fn orphans_of(&self, hash: &BlockHash) -> Result<Vec<StoredHeader>, Error>;
    /// Number of stored headers, in all states.
    fn count(&self) -> Result<usize, Error>;
    /// Height of the longest tip.
    fn height(&self) -> Result<Height, Error>;
    /// Whether a longest header at height zero exists.
    fn genesis_exists(&self) -> Result<bool, Error>;
    /// Heights of the given hashes, zero if unknown, followed by the stop hash height.
    fn locator_heights(
        &self,
        hashes: &[BlockHash],
        stop: &BlockHash,
    ) -> Result<(Vec<Height>, Height), Error>;
    /// The longest header at `height` if its merkle root matches and `height` is
    /// at most `tip_height`.
    fn merkle_root_confirmation(
        &self,
        merkle_root: &MerkleRoot,
        height: Height,
        tip_height: Height,
    ) -> Result<Option<StoredHeader>, Error>;
    /// Flush changes to durable storage.
    fn sync(&self) -> Result<(), Error>;
}
