//! In-memory header index shared by the storage backends.
//!
//! Writes are split into a validation step, which checks repository invariants
//! without mutating anything, and an apply step which cannot fail. Backends hold
//! their write lock across both steps, which is what makes each write a
//! transaction.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;

use headerchain_common::block::store::{Created, Error, HeaderState, StoredHeader};
use headerchain_common::block::{BlockHash, Height, MerkleRoot};
use headerchain_common::bitcoin::consensus::encode::{self, Decodable, Encodable};

/// A state change of a single header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    /// Header hash.
    pub hash: BlockHash,
    /// New state.
    pub state: HeaderState,
}

impl Change {
    /// Create a new state change.
    pub fn new(hash: BlockHash, state: HeaderState) -> Self {
        Self { hash, state }
    }
}

impl Encodable for Change {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.hash.consensus_encode(writer)? + self.state.consensus_encode(writer)?)
    }
}

impl Decodable for Change {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        Ok(Self {
            hash: Decodable::consensus_decode(reader)?,
            state: Decodable::consensus_decode(reader)?,
        })
    }
}

/// Indexed collection of stored headers.
#[derive(Debug, Default, Clone)]
pub struct Index {
    /// All headers, keyed by hash.
    headers: HashMap<BlockHash, StoredHeader>,
    /// Longest-chain headers by height.
    longest: BTreeMap<Height, BlockHash>,
    /// Longest and stale headers by height.
    heights: BTreeMap<Height, BTreeSet<BlockHash>>,
    /// Children of each header, by parent hash. Excludes rejected headers.
    children: HashMap<BlockHash, BTreeSet<BlockHash>>,
    /// Headers by merkle root.
    merkle: HashMap<MerkleRoot, Vec<BlockHash>>,
}

impl Index {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    ///////////////////////////////////////////////////////////////////////////
    // Writes
    ///////////////////////////////////////////////////////////////////////////

    /// Check that the given headers can be inserted. Returns the subset that isn't
    /// already stored, in order, without duplicates.
    pub fn validate_insert<'a>(
        &self,
        headers: &'a [StoredHeader],
    ) -> Result<Vec<&'a StoredHeader>, Error> {
        let mut pending: HashMap<BlockHash, &StoredHeader> = HashMap::new();
        let mut longest: HashMap<Height, BlockHash> = HashMap::new();
        let mut fresh = Vec::with_capacity(headers.len());

        for header in headers {
            if self.headers.contains_key(&header.hash) || pending.contains_key(&header.hash) {
                continue;
            }
            if matches!(header.state, HeaderState::Longest | HeaderState::Stale) && header.height > 0
            {
                let parent = self
                    .headers
                    .get(&header.prev_blockhash)
                    .or_else(|| pending.get(&header.prev_blockhash).copied());

                match parent {
                    Some(p) if p.height + 1 == header.height => {}
                    Some(p) => {
                        return Err(Error::Conflict(format!(
                            "header {} at height {} doesn't follow its parent at height {}",
                            header.hash, header.height, p.height
                        )))
                    }
                    None => {
                        return Err(Error::Conflict(format!(
                            "parent {} of header {} is not stored",
                            header.prev_blockhash, header.hash
                        )))
                    }
                }
            }
            if header.state == HeaderState::Longest {
                let occupied = self
                    .longest
                    .get(&header.height)
                    .or_else(|| longest.get(&header.height));

                if let Some(other) = occupied {
                    return Err(Error::Conflict(format!(
                        "height {} already has longest header {}",
                        header.height, other
                    )));
                }
                longest.insert(header.height, header.hash);
            }
            pending.insert(header.hash, header);
            fresh.push(header);
        }
        Ok(fresh)
    }

    /// Insert headers previously returned by [`Index::validate_insert`].
    pub fn apply_insert<'a>(&mut self, headers: impl IntoIterator<Item = &'a StoredHeader>) {
        for header in headers {
            self.index(header.clone());
        }
    }

    /// Validate and insert a single header.
    pub fn insert(&mut self, header: StoredHeader) -> Result<Created, Error> {
        if self.headers.contains_key(&header.hash) {
            return Ok(Created::AlreadyExists);
        }
        self.validate_insert(std::slice::from_ref(&header))?;
        self.index(header);

        Ok(Created::Inserted)
    }

    /// Check that the given state changes, applied in order, keep the longest
    /// chain unique per height.
    pub fn validate_changes(&self, changes: &[Change]) -> Result<(), Error> {
        let mut overlay: HashMap<Height, Option<BlockHash>> = HashMap::new();
        let mut states: HashMap<BlockHash, HeaderState> = HashMap::new();

        for change in changes {
            let header = self
                .headers
                .get(&change.hash)
                .ok_or(Error::NotFound(change.hash))?;
            let current = states.get(&change.hash).copied().unwrap_or(header.state);
            let occupant = match overlay.get(&header.height) {
                Some(occupant) => *occupant,
                None => self.longest.get(&header.height).copied(),
            };

            if change.state == HeaderState::Longest {
                if matches!(current, HeaderState::Orphan | HeaderState::Rejected) {
                    return Err(Error::Conflict(format!(
                        "{} header {} can't join the longest chain",
                        current, change.hash
                    )));
                }
                match occupant {
                    Some(other) if other != change.hash => {
                        return Err(Error::Conflict(format!(
                            "height {} already has longest header {}",
                            header.height, other
                        )));
                    }
                    _ => {
                        overlay.insert(header.height, Some(change.hash));
                    }
                }
            } else if occupant == Some(change.hash) {
                overlay.insert(header.height, None);
            }
            states.insert(change.hash, change.state);
        }
        Ok(())
    }

    /// Apply state changes previously validated with [`Index::validate_changes`].
    pub fn apply_changes(&mut self, changes: &[Change]) {
        for change in changes {
            if let Some(mut header) = self.headers.remove(&change.hash) {
                self.unindex(&header);
                header.state = change.state;
                self.index(header);
            }
        }
    }

    /// Check that an orphan can be replaced by its adopted form.
    pub fn validate_adopt(&self, header: &StoredHeader) -> Result<(), Error> {
        match self.headers.get(&header.hash) {
            Some(existing) if existing.state == HeaderState::Orphan => {}
            Some(existing) => {
                return Err(Error::Conflict(format!(
                    "header {} is {}, not an orphan",
                    header.hash, existing.state
                )))
            }
            None => return Err(Error::NotFound(header.hash)),
        }
        if header.state == HeaderState::Longest {
            if let Some(other) = self.longest.get(&header.height) {
                return Err(Error::Conflict(format!(
                    "height {} already has longest header {}",
                    header.height, other
                )));
            }
        }
        Ok(())
    }

    /// Replace an orphan previously validated with [`Index::validate_adopt`].
    pub fn apply_adopt(&mut self, header: StoredHeader) {
        if let Some(existing) = self.headers.remove(&header.hash) {
            self.unindex(&existing);
        }
        self.index(header);
    }

    fn index(&mut self, header: StoredHeader) {
        let hash = header.hash;

        match header.state {
            HeaderState::Longest => {
                self.longest.insert(header.height, hash);
                self.heights.entry(header.height).or_default().insert(hash);
            }
            HeaderState::Stale => {
                self.heights.entry(header.height).or_default().insert(hash);
            }
            HeaderState::Orphan | HeaderState::Rejected => {}
        }
        if header.state != HeaderState::Rejected {
            self.children
                .entry(header.prev_blockhash)
                .or_default()
                .insert(hash);
            self.merkle.entry(header.merkle_root).or_default().push(hash);
        }
        self.headers.insert(hash, header);
    }

    fn unindex(&mut self, header: &StoredHeader) {
        let hash = header.hash;

        if self.longest.get(&header.height) == Some(&hash) {
            self.longest.remove(&header.height);
        }
        if let Some(set) = self.heights.get_mut(&header.height) {
            set.remove(&hash);
            if set.is_empty() {
                self.heights.remove(&header.height);
            }
        }
        if let Some(set) = self.children.get_mut(&header.prev_blockhash) {
            set.remove(&hash);
            if set.is_empty() {
                self.children.remove(&header.prev_blockhash);
            }
        }
        if let Some(list) = self.merkle.get_mut(&header.merkle_root) {
            list.retain(|h| h != &hash);
            if list.is_empty() {
                self.merkle.remove(&header.merkle_root);
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Reads
    ///////////////////////////////////////////////////////////////////////////

    /// Get a header by hash.
    pub fn get(&self, hash: &BlockHash) -> Option<&StoredHeader> {
        self.headers.get(hash)
    }

    /// Get the header at a height, in the given state.
    pub fn get_by_height_in_state(
        &self,
        height: Height,
        state: HeaderState,
    ) -> Option<&StoredHeader> {
        match state {
            HeaderState::Longest => self.longest.get(&height).and_then(|h| self.headers.get(h)),
            HeaderState::Stale => self
                .heights
                .get(&height)?
                .iter()
                .filter_map(|h| self.headers.get(h))
                .find(|h| h.state == HeaderState::Stale),
            HeaderState::Orphan | HeaderState::Rejected => None,
        }
    }

    /// Longest and stale headers in a height range, ascending.
    pub fn range(&self, from: Height, to: Height) -> Vec<StoredHeader> {
        if from > to {
            return vec![];
        }
        self.heights
            .range(from..=to)
            .flat_map(|(_, hashes)| hashes.iter())
            .filter_map(|h| self.headers.get(h))
            .cloned()
            .collect()
    }

    /// Longest-chain headers from a height upwards.
    pub fn longest_from(&self, height: Height) -> Vec<StoredHeader> {
        self.longest
            .range(height..)
            .filter_map(|(_, h)| self.headers.get(h))
            .cloned()
            .collect()
    }

    /// Follow parents while headers are stale.
    pub fn stale_back_from(&self, hash: &BlockHash) -> Vec<StoredHeader> {
        let mut chain = Vec::new();
        let mut cursor = self.headers.get(hash);

        while let Some(header) = cursor {
            if header.state != HeaderState::Stale {
                break;
            }
            chain.push(header.clone());
            cursor = self.headers.get(&header.prev_blockhash);
        }
        chain
    }

    /// Parent of a header.
    pub fn previous(&self, hash: &BlockHash) -> Option<&StoredHeader> {
        let header = self.headers.get(hash)?;

        if header.state == HeaderState::Rejected {
            return None;
        }
        self.headers.get(&header.prev_blockhash)
    }

    /// Longest-chain header with the greatest height.
    pub fn tip(&self) -> Option<&StoredHeader> {
        self.longest
            .iter()
            .next_back()
            .and_then(|(_, h)| self.headers.get(h))
    }

    /// The tip and every childless non-longest header, rejected ones included.
    pub fn tips(&self) -> Vec<StoredHeader> {
        let mut tips: Vec<StoredHeader> = self.tip().into_iter().cloned().collect();

        tips.extend(
            self.headers
                .values()
                .filter(|h| h.state != HeaderState::Longest)
                .filter(|h| self.children.get(&h.hash).map_or(true, |c| c.is_empty()))
                .cloned(),
        );
        tips
    }

    /// Walk back from `hash` to the given height.
    pub fn ancestor(&self, hash: &BlockHash, height: Height) -> Option<&StoredHeader> {
        let mut header = self.headers.get(hash)?;

        if header.state == HeaderState::Orphan || header.state == HeaderState::Rejected {
            return if header.height == height {
                Some(header)
            } else {
                None
            };
        }
        if height > header.height || height < 0 {
            return None;
        }
        loop {
            if header.height == height {
                return Some(header);
            }
            if header.state == HeaderState::Longest {
                return self.get_by_height_in_state(height, HeaderState::Longest);
            }
            header = self.headers.get(&header.prev_blockhash)?;
        }
    }

    /// Ancestors of `high` down to and including `low`, ascending.
    pub fn between(&self, low: &BlockHash, high: &BlockHash) -> Vec<StoredHeader> {
        let Some(bottom) = self.headers.get(low) else {
            return vec![];
        };
        let mut chain = Vec::new();
        let mut cursor = self.headers.get(high);

        while let Some(header) = cursor {
            if header.height < bottom.height {
                return vec![];
            }
            chain.push(header.clone());

            if header.hash == *low {
                chain.reverse();
                return chain;
            }
            if header.height == 0 {
                break;
            }
            cursor = self.headers.get(&header.prev_blockhash);
        }
        vec![]
    }

    /// Orphans whose parent is the given hash.
    pub fn orphans_of(&self, hash: &BlockHash) -> Vec<StoredHeader> {
        self.children
            .get(hash)
            .into_iter()
            .flat_map(|c| c.iter())
            .filter_map(|h| self.headers.get(h))
            .filter(|h| h.state == HeaderState::Orphan)
            .cloned()
            .collect()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Height of the longest tip.
    pub fn height(&self) -> Height {
        self.longest.keys().next_back().copied().unwrap_or_default()
    }

    /// Whether a longest header at height zero exists.
    pub fn genesis_exists(&self) -> bool {
        self.longest.contains_key(&0)
    }

    /// Height of each hash, zero when unknown.
    pub fn heights_of(&self, hashes: &[BlockHash], stop: &BlockHash) -> (Vec<Height>, Height) {
        let height = |h: &BlockHash| self.headers.get(h).map_or(0, |h| h.height);

        (hashes.iter().map(height).collect(), height(stop))
    }

    /// Longest header at `height` with the given merkle root.
    pub fn merkle_root_confirmation(
        &self,
        merkle_root: &MerkleRoot,
        height: Height,
        tip_height: Height,
    ) -> Option<&StoredHeader> {
        if height > tip_height {
            return None;
        }
        self.merkle
            .get(merkle_root)?
            .iter()
            .filter_map(|h| self.headers.get(h))
            .find(|h| h.state == HeaderState::Longest && h.height == height)
    }
}
