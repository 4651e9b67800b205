//! Chain service.
//!
//! *Inserts headers, assigns them a state, and reorganizes the longest chain
//! when a competing branch overtakes it.*
//!
//! All writes go through [`ChainService::add`] and [`ChainService::reject`], which
//! hold a single-writer lock. Reads go straight to the store.
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time;

use thiserror::Error;

use headerchain_common::block::store::{self, Created, HeaderState, Store, StoredHeader};
use headerchain_common::block::{self, work, BlockHash, BlockHeader, BlockTime, Height, Work};
use headerchain_common::network::Network;

use crate::event::{Broadcast, HeaderAdded, Publisher};
use crate::merkle::{self, Confirmation, MerkleRootRequest};

/// Number of times a transient storage failure is retried.
pub const MAX_STORAGE_RETRIES: u32 = 3;

/// Delay before the first storage retry. Doubles on every retry.
pub const STORAGE_RETRY_BACKOFF: time::Duration = time::Duration::from_millis(50);

/// Maximum age of the tip for the chain to be considered current, in seconds.
pub const MAX_TIP_AGE: BlockTime = 60 * 60 * 24;

/// Log progress at info level every this many heights.
const PROGRESS_INTERVAL: Height = 2000;

/// A chain service error.
#[derive(Debug, Error)]
pub enum Error {
    /// The header is in the ignore set, or descends from a rejected header.
    #[error("block {0} is rejected")]
    BlockRejected(BlockHash),
    /// The store failed, even after retrying.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(store::Error),
    /// A write was refused because it would leave the store inconsistent.
    #[error("storage conflict: {0}")]
    StorageConflict(store::Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        if err.is_transient() {
            Self::StorageUnavailable(err)
        } else {
            Self::StorageConflict(err)
        }
    }
}

/// Outcome of adding a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The header was stored.
    Inserted,
    /// The header was already stored. Nothing changed.
    AlreadyExists,
    /// The header is rejected.
    Rejected,
    /// The header could not be stored.
    CreateFailed,
    /// The header was stored, but the longest chain could not be updated.
    ChainUpdateFailed,
}

impl AddOutcome {
    /// Whether the header is now stored and usable.
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Inserted | Self::AlreadyExists)
    }
}

/// Inserts headers and maintains the longest chain over a [`Store`].
#[derive(Debug)]
pub struct ChainService<S, P = Broadcast<HeaderAdded>> {
    store: S,
    events: P,
    genesis: BlockHash,
    ignored: HashSet<BlockHash>,
    lock: Mutex<()>,
}

impl<S: Store, P: Publisher<HeaderAdded>> ChainService<S, P> {
    /// Create a chain service for the given network. Headers in the network's
    /// ignore set are always rejected.
    pub fn new(store: S, network: Network, events: P) -> Self {
        Self {
            store,
            events,
            genesis: network.genesis_hash(),
            ignored: network.ignored_blocks().into_iter().collect(),
            lock: Mutex::new(()),
        }
    }

    /// Add hashes to the ignore set.
    pub fn ignore(mut self, hashes: impl IntoIterator<Item = BlockHash>) -> Self {
        self.ignored.extend(hashes);
        self
    }

    /// Insert the network's genesis header if the store doesn't have one.
    pub fn initialize(&self, genesis: BlockHeader) -> Result<(), Error> {
        if !self.retry("genesis_exists", || self.store.genesis_exists())? {
            let (header, outcome) = self.add(genesis);

            if !outcome.is_stored() || header.state != HeaderState::Longest {
                return Err(Error::StorageConflict(store::Error::Conflict(format!(
                    "genesis {} could not be stored ({:?})",
                    header.hash, outcome
                ))));
            }
        }
        Ok(())
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data, only ordering.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a store operation, retrying transient failures with exponential backoff.
    fn retry<T>(
        &self,
        op: &str,
        mut f: impl FnMut() -> Result<T, store::Error>,
    ) -> Result<T, store::Error> {
        let mut backoff = STORAGE_RETRY_BACKOFF;
        let mut attempt = 0;

        loop {
            match f() {
                Err(err) if err.is_transient() && attempt < MAX_STORAGE_RETRIES => {
                    attempt += 1;
                    log::warn!(
                        target: "chain",
                        "Storage operation `{}` failed ({}), retrying in {:?} ({}/{})",
                        op, err, backoff, attempt, MAX_STORAGE_RETRIES
                    );
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Writes
    ///////////////////////////////////////////////////////////////////////////

    /// Add a header received from the network.
    ///
    /// Returns the header as it is now stored, along with the outcome. Errors are
    /// logged and reflected in the outcome.
    pub fn add(&self, header: BlockHeader) -> (StoredHeader, AddOutcome) {
        let hash = header.block_hash();
        let _guard = self.write_lock();

        if self.ignored.contains(&hash) {
            log::warn!(target: "chain", "Header {} is in the ignore set", hash);
            return self.record_rejection(hash);
        }
        match self.retry("get_by_hash", || self.store.get_by_hash(&hash)) {
            Ok(Some(existing)) if existing.state == HeaderState::Rejected => {
                return (existing, AddOutcome::Rejected);
            }
            Ok(Some(existing)) => return (existing, AddOutcome::AlreadyExists),
            Ok(None) => {}
            Err(err) => {
                log::error!(target: "chain", "Failed to look up header {}: {}", hash, err);
                return (
                    StoredHeader::new(header, 0, HeaderState::Orphan, Work::zero()),
                    AddOutcome::CreateFailed,
                );
            }
        }

        let stored = match self.place(header) {
            Ok(stored) => stored,
            Err(Error::BlockRejected(parent)) => {
                log::warn!(target: "chain", "Header {} descends from rejected header {}", hash, parent);
                return self.record_rejection(hash);
            }
            Err(err) => {
                log::error!(target: "chain", "Failed to place header {}: {}", hash, err);
                return (
                    StoredHeader::new(header, 0, HeaderState::Orphan, Work::zero()),
                    AddOutcome::CreateFailed,
                );
            }
        };

        match self.retry("create", || self.store.create(stored.clone())) {
            Ok(Created::AlreadyExists) => return (stored, AddOutcome::AlreadyExists),
            Ok(Created::Inserted) => {}
            Err(err) => {
                log::error!(target: "chain", "Failed to store header {}: {}", hash, err);
                return (stored, AddOutcome::CreateFailed);
            }
        }
        self.added(&stored);

        let mut outcome = AddOutcome::Inserted;
        if let Err(err) = self.settle(&stored) {
            log::error!(target: "chain", "Failed to update chain after header {}: {}", hash, err);
            outcome = AddOutcome::ChainUpdateFailed;
        }
        let current = match self.store.get_by_hash(&hash) {
            Ok(Some(current)) => current,
            _ => stored,
        };
        (current, outcome)
    }

    /// Persist a header as rejected.
    pub fn reject(&self, hash: BlockHash) -> Result<(), Error> {
        let _guard = self.write_lock();
        self.retry("create", || self.store.create(StoredHeader::rejected(hash)))?;

        Ok(())
    }

    fn record_rejection(&self, hash: BlockHash) -> (StoredHeader, AddOutcome) {
        let rejected = StoredHeader::rejected(hash);

        if let Err(err) = self.retry("create", || self.store.create(rejected.clone())) {
            log::error!(target: "chain", "Failed to record rejected header {}: {}", hash, err);
        }
        (rejected, AddOutcome::Rejected)
    }

    /// Compute the height, cumulated work and state of a header from its parent.
    fn place(&self, header: BlockHeader) -> Result<StoredHeader, Error> {
        let hash = header.block_hash();

        if hash == self.genesis {
            return Ok(StoredHeader::genesis(header));
        }
        let parent = self.retry("get_by_hash", || self.store.get_by_hash(&header.prev_blockhash))?;

        let Some(parent) = parent else {
            return Ok(StoredHeader::new(header, 0, HeaderState::Orphan, Work::zero()));
        };
        let height = parent.height + 1;
        let cumulated_work = parent.cumulated_work.saturating_add(work::work(header.bits));

        let state = match parent.state {
            HeaderState::Rejected => return Err(Error::BlockRejected(parent.hash)),
            HeaderState::Orphan => {
                return Ok(StoredHeader::new(header, 0, HeaderState::Orphan, Work::zero()))
            }
            HeaderState::Stale => HeaderState::Stale,
            HeaderState::Longest => {
                let occupied = self.retry("get_by_height_in_state", || {
                    self.store.get_by_height_in_state(height, HeaderState::Longest)
                })?;
                if occupied.is_some() {
                    HeaderState::Stale
                } else {
                    HeaderState::Longest
                }
            }
        };
        Ok(StoredHeader::new(header, height, state, cumulated_work))
    }

    /// Reorganize if the header overtook the tip, then adopt any orphans waiting on
    /// it, recursively.
    fn settle(&self, header: &StoredHeader) -> Result<(), Error> {
        let mut queue = VecDeque::from([header.clone()]);
        let mut result = Ok(());

        while let Some(header) = queue.pop_front() {
            if header.state == HeaderState::Stale {
                if let Err(err) = self.reorg_if_heavier(&header) {
                    result = Err(err);
                }
            }
            if header.state == HeaderState::Orphan {
                continue;
            }
            let orphans = self.retry("orphans_of", || self.store.orphans_of(&header.hash))?;

            for orphan in orphans {
                // The parent may have changed state in a reorg.
                let Some(parent) = self.retry("get_by_hash", || self.store.get_by_hash(&header.hash))?
                else {
                    continue;
                };
                let adopted = self.adopt(&orphan, &parent)?;
                queue.push_back(adopted);
            }
        }
        result
    }

    fn adopt(&self, orphan: &StoredHeader, parent: &StoredHeader) -> Result<StoredHeader, Error> {
        let height = parent.height + 1;
        let state = match parent.state {
            HeaderState::Longest => {
                let occupied = self.retry("get_by_height_in_state", || {
                    self.store.get_by_height_in_state(height, HeaderState::Longest)
                })?;
                if occupied.is_some() {
                    HeaderState::Stale
                } else {
                    HeaderState::Longest
                }
            }
            _ => HeaderState::Stale,
        };
        let adopted = StoredHeader::new(
            orphan.header,
            height,
            state,
            parent.cumulated_work.saturating_add(work::work(orphan.bits)),
        );
        self.retry("adopt", || self.store.adopt(adopted.clone()))?;

        log::debug!(
            target: "chain",
            "Orphan {} adopted at height {} as {}",
            adopted.hash, adopted.height, adopted.state
        );
        self.added(&adopted);

        Ok(adopted)
    }

    fn reorg_if_heavier(&self, header: &StoredHeader) -> Result<(), Error> {
        let Some(tip) = self.retry("tip", || self.store.tip())? else {
            return Ok(());
        };
        if header.cumulated_work <= tip.cumulated_work {
            return Ok(());
        }
        self.reorg(header, &tip)
    }

    /// Switch the longest chain to the branch ending at `header`.
    fn reorg(&self, header: &StoredHeader, tip: &StoredHeader) -> Result<(), Error> {
        let mut branch = self.retry("stale_chain_back_from", || {
            self.store.stale_chain_back_from(&header.hash)
        })?;
        branch.reverse();

        let Some(first) = branch.first() else {
            return Ok(());
        };
        let fork = self
            .retry("get_by_hash", || self.store.get_by_hash(&first.prev_blockhash))?
            .filter(|f| f.state == HeaderState::Longest)
            .ok_or_else(|| {
                Error::StorageConflict(store::Error::Conflict(format!(
                    "branch ending at {} has no fork point on the longest chain",
                    header.hash
                )))
            })?;
        let old = self.retry("longest_chain_from", || {
            self.store.longest_chain_from(fork.height + 1)
        })?;
        let stale = old.iter().map(|h| h.hash).collect::<Vec<_>>();
        let longest = branch.iter().map(|h| h.hash).collect::<Vec<_>>();

        self.retry("switch_branch", || self.store.switch_branch(&stale, &longest))?;

        log::warn!(
            target: "chain",
            "Chain reorganized at fork height {}: {} header(s) replaced by {}, tip {} -> {}",
            fork.height,
            stale.len(),
            longest.len(),
            tip.hash,
            header.hash
        );
        for h in branch {
            self.added(&StoredHeader {
                state: HeaderState::Longest,
                ..h
            });
        }
        Ok(())
    }

    /// Log and publish a header that is now stored.
    fn added(&self, header: &StoredHeader) {
        if header.state != HeaderState::Longest {
            log::debug!(
                target: "chain",
                "Header {} stored as {} at height {}",
                header.hash, header.state, header.height
            );
            return;
        }
        if header.height % PROGRESS_INTERVAL == 0 {
            log::info!(target: "chain", "Tip at height {} ({})", header.height, header.hash);
        } else {
            log::debug!(target: "chain", "Header {} added at height {}", header.hash, header.height);
        }
        self.events.publish(HeaderAdded::from(header));
    }

    ///////////////////////////////////////////////////////////////////////////
    // Reads
    ///////////////////////////////////////////////////////////////////////////

    /// The longest chain tip.
    pub fn tip(&self) -> Result<Option<StoredHeader>, Error> {
        Ok(self.retry("tip", || self.store.tip())?)
    }

    /// Height of the longest chain tip.
    pub fn height(&self) -> Result<Height, Error> {
        Ok(self.retry("height", || self.store.height())?)
    }

    /// Get a header by hash.
    pub fn get(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, Error> {
        Ok(self.retry("get_by_hash", || self.store.get_by_hash(hash))?)
    }

    /// Get the longest-chain header at a height.
    pub fn get_at(&self, height: Height) -> Result<Option<StoredHeader>, Error> {
        Ok(self.retry("get_by_height_in_state", || {
            self.store.get_by_height_in_state(height, HeaderState::Longest)
        })?)
    }

    /// Get the ancestor of a header at a height.
    pub fn ancestor(&self, hash: &BlockHash, height: Height) -> Result<Option<StoredHeader>, Error> {
        Ok(self.retry("ancestor_on_height", || {
            self.store.ancestor_on_height(hash, height)
        })?)
    }

    /// Whether the header is stored in a state other than rejected.
    pub fn is_known(&self, hash: &BlockHash) -> Result<bool, Error> {
        Ok(self
            .get(hash)?
            .map_or(false, |h| h.state != HeaderState::Rejected))
    }

    /// Height the given header would have if added, when its parent is on a known
    /// branch.
    pub fn next_height(&self, header: &BlockHeader) -> Result<Option<Height>, Error> {
        if header.block_hash() == self.genesis {
            return Ok(Some(0));
        }
        Ok(self
            .get(&header.prev_blockhash)?
            .filter(|p| matches!(p.state, HeaderState::Longest | HeaderState::Stale))
            .map(|p| p.height + 1))
    }

    /// Block locator hashes of the longest chain, from the tip down to genesis.
    pub fn locator_hashes(&self) -> Result<Vec<BlockHash>, Error> {
        let height = self.height()?;
        let mut hashes = Vec::new();

        for h in block::locators_indexes(height) {
            if let Some(header) = self.get_at(h)? {
                hashes.push(header.hash);
            }
        }
        Ok(hashes)
    }

    /// Find the longest-chain headers following the first locator hash that is on
    /// the longest chain, up to the stop hash and at most `max_headers`.
    ///
    /// Without locators, returns the header with the stop hash, if any. When no
    /// locator is on the longest chain, starts after genesis.
    pub fn locate_headers(
        &self,
        locators: &[BlockHash],
        stop: &BlockHash,
        max_headers: usize,
    ) -> Result<Vec<BlockHeader>, Error> {
        if locators.is_empty() {
            return Ok(self.get(stop)?.into_iter().map(|h| h.header).collect());
        }
        let (heights, stop_height) =
            self.retry("locator_heights", || self.store.locator_heights(locators, stop))?;

        let mut start = 0;
        for (hash, height) in locators.iter().zip(heights) {
            if self.get_at(height)?.map_or(false, |h| h.hash == *hash) {
                start = height;
                break;
            }
        }
        let tip = self.height()?;
        let stop_height = if stop_height > 0 { stop_height } else { tip };
        let end = stop_height
            .min(start.saturating_add(max_headers as Height))
            .min(tip);

        if end <= start {
            return Ok(vec![]);
        }
        let headers = self.retry("get_by_height_range", || {
            self.store.get_by_height_range(start + 1, end)
        })?;

        Ok(headers
            .into_iter()
            .filter(|h| h.state == HeaderState::Longest)
            .map(|h| h.header)
            .collect())
    }

    /// Whether the tip is past every checkpoint, and recent relative to the given
    /// network-adjusted time.
    pub fn is_current(&self, last_checkpoint: Height, now: BlockTime) -> Result<bool, Error> {
        let Some(tip) = self.tip()? else {
            return Ok(false);
        };
        Ok(tip.height >= last_checkpoint && tip.time >= now.saturating_sub(MAX_TIP_AGE))
    }

    /// Confirm that merkle roots are included in the longest chain.
    pub fn confirm_merkle_roots(
        &self,
        requests: &[MerkleRootRequest],
        max_excess: Height,
    ) -> Result<Vec<Confirmation>, Error> {
        Ok(self.retry("merkle_root_confirmation", || {
            merkle::confirm(&self.store, requests, max_excess)
        })?)
    }
}

#[cfg(test)]
mod test;
