//! Persistent storage backend for headers.
//!
//! The store is an append-only log of records. Each record is framed as
//! `length (u32) | checksum (4 bytes) | payload`, where the checksum is the start
//! of the payload's double-SHA256. A record is one transaction: on open, the log
//! is replayed into an in-memory [`Index`], and a torn or corrupt record at the
//! end of the file is detected by [`File::check`] and removed by [`File::heal`].
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use headerchain_common::block::store::{Created, Error, HeaderState, Store, StoredHeader};
use headerchain_common::bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};
use headerchain_common::bitcoin_hashes::{sha256d, Hash};
use headerchain_common::block::{BlockHash, Height, MerkleRoot};

use super::index::{Change, Index};

/// Default number of headers written per transaction by `create_batch`.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Size of a record frame header.
const FRAME_SIZE: usize = 8;

/// A log record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    /// Headers inserted.
    Insert(Vec<StoredHeader>),
    /// Header state changes, applied in order.
    Transition(Vec<Change>),
    /// An orphan replaced by its adopted form.
    Adopt(StoredHeader),
}

/// Encode a length-prefixed list.
fn encode_list<T: Encodable, W: io::Write + ?Sized>(
    items: &[T],
    writer: &mut W,
) -> Result<usize, io::Error> {
    let mut len = VarInt(items.len() as u64).consensus_encode(writer)?;

    for item in items {
        len += item.consensus_encode(writer)?;
    }
    Ok(len)
}

/// Decode a length-prefixed list.
fn decode_list<T: Decodable, R: io::Read + ?Sized>(reader: &mut R) -> Result<Vec<T>, encode::Error> {
    let VarInt(len) = VarInt::consensus_decode(reader)?;
    // The payload is checksummed, but don't trust the prefix with an allocation.
    let mut items = Vec::with_capacity(len.min(1024) as usize);

    for _ in 0..len {
        items.push(T::consensus_decode(reader)?);
    }
    Ok(items)
}

impl Encodable for Record {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::Insert(headers) => Ok(0u8.consensus_encode(writer)? + encode_list(headers, writer)?),
            Self::Transition(changes) => {
                Ok(1u8.consensus_encode(writer)? + encode_list(changes, writer)?)
            }
            Self::Adopt(header) => Ok(2u8.consensus_encode(writer)? + header.consensus_encode(writer)?),
        }
    }
}

impl Decodable for Record {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        match u8::consensus_decode(reader)? {
            0 => Ok(Self::Insert(decode_list(reader)?)),
            1 => Ok(Self::Transition(decode_list(reader)?)),
            2 => Ok(Self::Adopt(Decodable::consensus_decode(reader)?)),
            _ => Err(encode::Error::ParseFailed("unknown record type")),
        }
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d::Hash::hash(payload).into_inner();

    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode a record with its frame, onto the end of `buf`.
fn frame(record: &Record, buf: &mut Vec<u8>) {
    let payload = encode::serialize(record);

    buf.reserve(FRAME_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum(&payload));
    buf.extend_from_slice(&payload);
}

/// Decode the record at the start of `bytes`. Returns `None` if the record is
/// incomplete or fails its checksum.
fn unframe(bytes: &[u8]) -> Option<(Record, usize)> {
    if bytes.len() < FRAME_SIZE {
        return None;
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let payload = bytes.get(FRAME_SIZE..FRAME_SIZE + len)?;

    if checksum(payload) != bytes[4..FRAME_SIZE] {
        return None;
    }
    let record = encode::deserialize(payload).ok()?;

    Some((record, FRAME_SIZE + len))
}

/// Apply a replayed record to an index.
fn replay(index: &mut Index, record: Record) -> Result<(), Error> {
    match record {
        Record::Insert(headers) => {
            let fresh = index.validate_insert(&headers)?;
            index.apply_insert(fresh);
        }
        Record::Transition(changes) => {
            index.validate_changes(&changes)?;
            index.apply_changes(&changes);
        }
        Record::Adopt(header) => {
            index.validate_adopt(&header)?;
            index.apply_adopt(header);
        }
    }
    Ok(())
}

/// A `Store` backed by a single file.
#[derive(Debug)]
pub struct File {
    file: fs::File,
    index: RwLock<Index>,
    /// Length of the valid prefix of the file.
    valid: RwLock<u64>,
    batch_size: usize,
    /// Number of bytes the next append may write before failing.
    #[cfg(test)]
    write_limit: Option<usize>,
}

impl File {
    /// Open a file store at the given path, creating it if it doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        Self::load(file)
    }

    /// Create a new file store at the given path. Fails if the file exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(path)?;

        Self::load(file)
    }

    /// Set the number of headers written per transaction by `create_batch`.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    fn load(file: fs::File) -> Result<Self, Error> {
        let bytes = {
            let mut buf = Vec::new();
            io::Read::read_to_end(&mut &file, &mut buf)?;
            buf
        };
        let mut index = Index::new();
        let mut offset = 0;

        while let Some((record, len)) = unframe(&bytes[offset..]) {
            replay(&mut index, record).map_err(|_| Error::Corruption)?;
            offset += len;
        }
        if offset < bytes.len() {
            log::warn!(
                target: "chain",
                "Header store has {} trailing byte(s) of corrupt data",
                bytes.len() - offset
            );
        }

        Ok(Self {
            file,
            index: RwLock::new(index),
            valid: RwLock::new(offset as u64),
            batch_size: DEFAULT_BATCH_SIZE,
            #[cfg(test)]
            write_limit: None,
        })
    }

    /// Check the file store integrity.
    pub fn check(&self) -> Result<(), Error> {
        let len = self.file.metadata()?.len();
        let valid = *self.valid.read().map_err(|_| Error::Poisoned)?;

        if len != valid {
            return Err(Error::Corruption);
        }
        Ok(())
    }

    /// Attempt to heal data corruption, by truncating the log after the last
    /// valid record.
    pub fn heal(&self) -> Result<(), Error> {
        let valid = *self.valid.read().map_err(|_| Error::Poisoned)?;

        if self.file.metadata()?.len() != valid {
            self.file.set_len(valid)?;
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Index>, Error> {
        self.index.read().map_err(|_| Error::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Index>, Error> {
        self.index.write().map_err(|_| Error::Poisoned)
    }

    /// Append records in a single write. Either all of them make it to the file,
    /// or none do. Must be called with the index write lock held.
    fn append(&self, records: &[Record]) -> Result<(), Error> {
        let mut bytes = Vec::new();
        for record in records {
            frame(record, &mut bytes);
        }
        let mut valid = self.valid.write().map_err(|_| Error::Poisoned)?;

        if let Err(err) = self.write_all(&bytes) {
            // Drop whatever part of the write made it to the file.
            self.file.set_len(*valid)?;
            return Err(err.into());
        }
        *valid += bytes.len() as u64;

        Ok(())
    }

    #[cfg(not(test))]
    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        (&self.file).write_all(bytes)
    }

    #[cfg(test)]
    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        match self.write_limit {
            Some(limit) if limit < bytes.len() => {
                (&self.file).write_all(&bytes[..limit])?;
                Err(io::Error::new(io::ErrorKind::WriteZero, "write limit reached"))
            }
            _ => (&self.file).write_all(bytes),
        }
    }

    fn transition(&self, changes: Vec<Change>) -> Result<(), Error> {
        let mut index = self.write()?;

        index.validate_changes(&changes)?;
        self.append(&[Record::Transition(changes.clone())])?;
        index.apply_changes(&changes);

        Ok(())
    }
}

impl Store for File {
    fn create(&self, header: StoredHeader) -> Result<Created, Error> {
        let mut index = self.write()?;

        if index.get(&header.hash).is_some() {
            return Ok(Created::AlreadyExists);
        }
        index.validate_insert(std::slice::from_ref(&header))?;
        self.append(&[Record::Insert(vec![header.clone()])])?;
        index.apply_insert(std::iter::once(&header));

        Ok(Created::Inserted)
    }

    fn create_batch(&self, headers: Vec<StoredHeader>) -> Result<usize, Error> {
        let mut index = self.write()?;
        let fresh = index
            .validate_insert(&headers)?
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();

        let records = fresh
            .chunks(self.batch_size)
            .map(|chunk| Record::Insert(chunk.to_vec()))
            .collect::<Vec<_>>();

        self.append(&records)?;
        index.apply_insert(&fresh);

        Ok(fresh.len())
    }

    fn update_state(&self, hashes: &[BlockHash], state: HeaderState) -> Result<(), Error> {
        self.transition(hashes.iter().map(|h| Change::new(*h, state)).collect())
    }

    fn switch_branch(&self, stale: &[BlockHash], longest: &[BlockHash]) -> Result<(), Error> {
        self.transition(
            stale
                .iter()
                .map(|h| Change::new(*h, HeaderState::Stale))
                .chain(longest.iter().map(|h| Change::new(*h, HeaderState::Longest)))
                .collect(),
        )
    }

    fn adopt(&self, header: StoredHeader) -> Result<(), Error> {
        let mut index = self.write()?;

        index.validate_adopt(&header)?;
        self.append(&[Record::Adopt(header.clone())])?;
        index.apply_adopt(header);

        Ok(())
    }

    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, Error> {
        Ok(self.read()?.get(hash).cloned())
    }

    fn get_by_height_in_state(
        &self,
        height: Height,
        state: HeaderState,
    ) -> Result<Option<StoredHeader>, Error> {
        Ok(self.read()?.get_by_height_in_state(height, state).cloned())
    }

    fn get_by_height_range(&self, from: Height, to: Height) -> Result<Vec<StoredHeader>, Error> {
        Ok(self.read()?.range(from, to))
    }

    fn longest_chain_from(&self, height: Height) -> Result<Vec<StoredHeader>, Error> {
        Ok(self.read()?.longest_from(height))
    }

    fn stale_chain_back_from(&self, hash: &BlockHash) -> Result<Vec<StoredHeader>, Error> {
        Ok(self.read()?.stale_back_from(hash))
    }

    fn previous(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, Error> {
        Ok(self.read()?.previous(hash).cloned())
    }

    fn tip(&self) -> Result<Option<StoredHeader>, Error> {
        Ok(self.read()?.tip().cloned())
    }

    fn all_tips(&self) -> Result<Vec<StoredHeader>, Error> {
        Ok(self.read()?.tips())
    }

    fn ancestor_on_height(
        &self,
        hash: &BlockHash,
        height: Height,
    ) -> Result<Option<StoredHeader>, Error> {
        Ok(self.read()?.ancestor(hash, height).cloned())
    }

    fn chain_between(
        &self,
        low: &BlockHash,
        high: &BlockHash,
    ) -> Result<Vec<StoredHeader>, Error> {
        Ok(self.read()?.between(low, high))
    }

    fn orphans_of(&self, hash: &BlockHash) -> Result<Vec<StoredHeader>, Error> {
        Ok(self.read()?.orphans_of(hash))
    }

    fn count(&self) -> Result<usize, Error> {
        Ok(self.read()?.len())
    }

    fn height(&self) -> Result<Height, Error> {
        Ok(self.read()?.height())
    }

    fn genesis_exists(&self) -> Result<bool, Error> {
        Ok(self.read()?.genesis_exists())
    }

    fn locator_heights(
        &self,
        hashes: &[BlockHash],
        stop: &BlockHash,
    ) -> Result<(Vec<Height>, Height), Error> {
        Ok(self.read()?.heights_of(hashes, stop))
    }

    fn merkle_root_confirmation(
        &self,
        merkle_root: &MerkleRoot,
        height: Height,
        tip_height: Height,
    ) -> Result<Option<StoredHeader>, Error> {
        Ok(self
            .read()?
            .merkle_root_confirmation(merkle_root, height, tip_height)
            .cloned())
    }

    /// Flush changes to disk.
    fn sync(&self) -> Result<(), Error> {
        self.file.sync_data().map_err(Error::from)
    }
}
