//! Ephemeral storage backend for headers.
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use headerchain_common::block::store::{
    Created, Error, HeaderState, Store, StoredHeader,
};
use headerchain_common::block::{BlockHash, BlockHeader, Height, MerkleRoot};

use super::index::{Change, Index};

/// In-memory header store.
#[derive(Debug, Default)]
pub struct Memory {
    index: RwLock<Index>,
}

impl Memory {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding only the given genesis header.
    pub fn genesis(genesis: BlockHeader) -> Self {
        let mut index = Index::new();
        // Inserting into an empty index can't conflict.
        let _ = index.insert(StoredHeader::genesis(genesis));

        Self {
            index: RwLock::new(index),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Index>, Error> {
        self.index.read().map_err(|_| Error::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Index>, Error> {
        self.index.write().map_err(|_| Error::Poisoned)
    }
}

impl Store for Memory {
    fn create(&self, header: StoredHeader) -> Result<Created, Error> {
        self.write()?.insert(header)
    }

    fn create_batch(&self, headers: Vec<StoredHeader>) -> Result<usize, Error> {
        let mut index = self.write()?;
        let fresh = index.validate_insert(&headers)?;
        let count = fresh.len();

        index.apply_insert(fresh);

        Ok(count)
    }

    fn update_state(&self, hashes: &[BlockHash], state: HeaderState) -> Result<(), Error> {
        let changes = hashes
            .iter()
            .map(|h| Change::new(*h, state))
            .collect::<Vec<_>>();
        let mut index = self.write()?;

        index.validate_changes(&changes)?;
        index.apply_changes(&changes);

        Ok(())
    }

    fn switch_branch(&self, stale: &[BlockHash], longest: &[BlockHash]) -> Result<(), Error> {
        let changes = stale
            .iter()
            .map(|h| Change::new(*h, HeaderState::Stale))
            .chain(longest.iter().map(|h| Change::new(*h, HeaderState::Longest)))
            .collect::<Vec<_>>();
        let mut index = self.write()?;

        index.validate_changes(&changes)?;
        index.apply_changes(&changes);

        Ok(())
    }

    fn adopt(&self, header: StoredHeader) -> Result<(), Error> {
        let mut index = self.write()?;

        index.validate_adopt(&header)?;
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

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}
