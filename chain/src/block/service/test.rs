use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use quickcheck_macros::quickcheck;

use headerchain_common::bitcoin_hashes::Hash;

use headerchain_common::block::store::{Created, Error as StoreError, HeaderState, Store, StoredHeader};
use headerchain_common::block::{genesis, work, BlockHash, BlockHeader, Height, MerkleRoot, Work};
use headerchain_common::network::Network;
use headerchain_test::block::{arbitrary, gen, mainnet_block_1};

use super::*;
use crate::block::store::Memory;
use crate::merkle::{Confirmation, MerkleRootRequest};

/// Bits carrying roughly twice the work of the mainnet genesis bits.
const HEAVY_BITS: u32 = 0x1c7fffff;

#[derive(Debug, Default, Clone)]
struct Recorder(Arc<Mutex<Vec<HeaderAdded>>>);

impl Recorder {
    fn heights(&self) -> Vec<Height> {
        self.0.lock().unwrap().iter().map(|e| e.height).collect()
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

impl Publisher<HeaderAdded> for Recorder {
    fn publish(&self, event: HeaderAdded) {
        self.0.lock().unwrap().push(event);
    }
}

fn mainnet() -> (ChainService<Memory, Recorder>, Recorder) {
    let recorder = Recorder::default();
    let service = ChainService::new(Memory::new(), Network::Mainnet, recorder.clone());

    (service, recorder)
}

/// Mainnet genesis followed by `len` unsolved headers at genesis difficulty.
fn mainnet_chain(
    service: &ChainService<Memory, Recorder>,
    len: usize,
    rng: &fastrand::Rng,
) -> Vec<StoredHeader> {
    let genesis = genesis::mainnet();
    let mut chain = vec![service.add(genesis).0];

    for header in gen::unsolved_chain(&genesis, len, genesis.bits, rng) {
        let (stored, outcome) = service.add(header);

        assert_eq!(outcome, AddOutcome::Inserted);
        chain.push(stored);
    }
    chain
}

#[test]
fn test_genesis_insertion() {
    let (service, events) = mainnet();
    let (stored, outcome) = service.add(genesis::mainnet());

    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(stored.state, HeaderState::Longest);
    assert_eq!(stored.height, 0);
    assert_eq!(stored.cumulated_work, Work::from(4_295_032_833u64));
    assert_eq!(events.heights(), vec![0]);
}

#[test]
fn test_extend_longest_chain() {
    let (service, _) = mainnet();
    service.initialize(genesis::mainnet()).unwrap();

    let (stored, outcome) = service.add(mainnet_block_1());

    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(stored.state, HeaderState::Longest);
    assert_eq!(stored.height, 1);
    assert_eq!(
        stored.merkle_root.to_string(),
        "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098"
    );
    assert_eq!(stored.cumulated_work, Work::from(2 * 4_295_032_833u64));
    assert_eq!(service.tip().unwrap().unwrap().height, 1);
}

#[test]
fn test_duplicate_insert() {
    let (service, events) = mainnet();
    service.initialize(genesis::mainnet()).unwrap();
    let (first, _) = service.add(mainnet_block_1());
    events.clear();

    let (second, outcome) = service.add(mainnet_block_1());

    assert_eq!(outcome, AddOutcome::AlreadyExists);
    assert_eq!(first, second);
    assert_eq!(service.store().count().unwrap(), 2);
    assert!(events.heights().is_empty());
}

#[test]
fn test_stale_fork_without_reorg() {
    let rng = fastrand::Rng::with_seed(1);
    let (service, events) = mainnet();
    let chain = mainnet_chain(&service, 4, &rng);
    events.clear();

    let fork = gen::unsolved(&chain[1].header, 0x1d00ffff, &rng);
    let (stored, outcome) = service.add(fork);

    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(stored.state, HeaderState::Stale);
    assert_eq!(stored.height, 2);
    assert_eq!(service.tip().unwrap().unwrap(), chain[4]);
    assert!(events.heights().is_empty());
}

#[test]
fn test_reorg() {
    let rng = fastrand::Rng::with_seed(2);
    let (service, events) = mainnet();
    let chain = mainnet_chain(&service, 4, &rng);
    events.clear();

    let fork = gen::unsolved_chain(&chain[1].header, 2, HEAVY_BITS, &rng);

    let (a, outcome) = service.add(fork[0]);
    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(a.state, HeaderState::Stale);
    assert!(a.cumulated_work < chain[4].cumulated_work);

    let (b, outcome) = service.add(fork[1]);
    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(b.state, HeaderState::Longest);
    assert!(b.cumulated_work > chain[4].cumulated_work);

    let store = service.store();
    for old in &chain[2..] {
        assert_eq!(
            store.get_by_hash(&old.hash).unwrap().unwrap().state,
            HeaderState::Stale
        );
    }
    for new in &fork {
        assert_eq!(
            store.get_by_hash(&new.block_hash()).unwrap().unwrap().state,
            HeaderState::Longest
        );
    }
    let tip = service.tip().unwrap().unwrap();
    assert_eq!(tip.hash, fork[1].block_hash());
    assert_eq!(tip.height, 3);
    assert_eq!(store.longest_chain_from(0).unwrap().len(), 4);
    assert_eq!(events.heights(), vec![2, 3]);
}

#[test]
fn test_merkle_confirmation() {
    let rng = fastrand::Rng::with_seed(3);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 4, &rng);
    let any = MerkleRoot::hash(b"any");
    let requests = [
        MerkleRootRequest {
            merkle_root: chain[1].merkle_root,
            height: 1,
        },
        MerkleRootRequest {
            merkle_root: any,
            height: 2,
        },
        MerkleRootRequest {
            merkle_root: any,
            height: 8,
        },
        MerkleRootRequest {
            merkle_root: any,
            height: 100,
        },
    ];

    assert_eq!(
        service.confirm_merkle_roots(&requests, 6).unwrap(),
        vec![
            Confirmation::Confirmed(chain[1].hash),
            Confirmation::Invalid,
            Confirmation::UnableToVerify,
            Confirmation::Invalid,
        ]
    );
}

#[test]
fn test_orphan_adoption() {
    let rng = fastrand::Rng::with_seed(4);
    let (service, events) = mainnet();
    let chain = mainnet_chain(&service, 2, &rng);
    let next = gen::unsolved_chain(&chain[2].header, 3, 0x1d00ffff, &rng);
    events.clear();

    let (orphan, outcome) = service.add(next[2]);
    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(orphan.state, HeaderState::Orphan);
    assert_eq!(orphan.height, 0);
    assert_eq!(orphan.cumulated_work, Work::zero());

    let (orphan, _) = service.add(next[1]);
    assert_eq!(orphan.state, HeaderState::Orphan);

    let (parent, outcome) = service.add(next[0]);
    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(parent.state, HeaderState::Longest);

    let tip = service.tip().unwrap().unwrap();
    assert_eq!(tip.hash, next[2].block_hash());
    assert_eq!(tip.height, 5);
    assert_eq!(
        tip.cumulated_work,
        chain[2].cumulated_work + work::work(next[2].bits) * Work::from(3u64)
    );
    assert!(service.store().orphans_of(&parent.hash).unwrap().is_empty());
    assert_eq!(events.heights(), vec![3, 4, 5]);
}

#[test]
fn test_ignored_header() {
    let rng = fastrand::Rng::with_seed(5);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 1, &rng);
    let bad = gen::unsolved(&chain[1].header, 0x1d00ffff, &rng);
    let service = service.ignore([bad.block_hash()]);

    let (stored, outcome) = service.add(bad);
    assert_eq!(outcome, AddOutcome::Rejected);
    assert_eq!(stored.state, HeaderState::Rejected);
    assert_eq!(
        service.get(&bad.block_hash()).unwrap().unwrap().state,
        HeaderState::Rejected
    );
    assert!(!service.is_known(&bad.block_hash()).unwrap());

    // Adding it again, or a child, is rejected too.
    assert_eq!(service.add(bad).1, AddOutcome::Rejected);

    let child = gen::unsolved(&bad, 0x1d00ffff, &rng);
    assert_eq!(service.add(child).1, AddOutcome::Rejected);
    assert_eq!(service.tip().unwrap().unwrap(), chain[1]);
}

#[test]
fn test_reject() {
    let rng = fastrand::Rng::with_seed(6);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 1, &rng);
    let header = gen::unsolved(&chain[1].header, 0x1d00ffff, &rng);

    service.reject(header.block_hash()).unwrap();

    assert_eq!(service.add(header).1, AddOutcome::Rejected);
    assert_eq!(service.height().unwrap(), 1);
}

#[test]
fn test_locator_hashes() {
    let rng = fastrand::Rng::with_seed(7);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 30, &rng);
    let locators = service.locator_hashes().unwrap();

    assert_eq!(locators.len(), block::locators_indexes(30).len());
    assert_eq!(locators[0], chain[30].hash);
    assert_eq!(locators[1], chain[29].hash);
    assert_eq!(locators.last(), Some(&genesis::mainnet().block_hash()));
}

#[test]
fn test_locate_headers() {
    let rng = fastrand::Rng::with_seed(8);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 20, &rng);
    let hashes = |headers: Vec<BlockHeader>| {
        headers.iter().map(|h| h.block_hash()).collect::<Vec<_>>()
    };
    let expected = |range: std::ops::RangeInclusive<usize>| {
        chain[range].iter().map(|h| h.hash).collect::<Vec<_>>()
    };
    let unknown = BlockHash::hash(b"unknown");
    let zero = BlockHash::all_zeros();

    // First known locator wins.
    let headers = service
        .locate_headers(&[unknown, chain[10].hash, chain[5].hash], &zero, 2000)
        .unwrap();
    assert_eq!(hashes(headers), expected(11..=20));

    // Stop hash and limit.
    let headers = service
        .locate_headers(&[chain[10].hash], &chain[15].hash, 2000)
        .unwrap();
    assert_eq!(hashes(headers), expected(11..=15));

    let headers = service.locate_headers(&[chain[10].hash], &zero, 3).unwrap();
    assert_eq!(hashes(headers), expected(11..=13));

    // No known locator starts after genesis.
    let headers = service.locate_headers(&[unknown], &chain[2].hash, 2000).unwrap();
    assert_eq!(hashes(headers), expected(1..=2));

    // Up to date.
    assert!(service
        .locate_headers(&[chain[20].hash], &zero, 2000)
        .unwrap()
        .is_empty());

    // No locators.
    let headers = service.locate_headers(&[], &chain[7].hash, 2000).unwrap();
    assert_eq!(hashes(headers), expected(7..=7));
}

#[test]
fn test_is_current() {
    let rng = fastrand::Rng::with_seed(9);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 3, &rng);
    let tip = &chain[3];

    assert!(service.is_current(3, tip.time + 60).unwrap());
    assert!(!service.is_current(4, tip.time + 60).unwrap());
    assert!(!service
        .is_current(0, tip.time + MAX_TIP_AGE + 1)
        .unwrap());
}

#[test]
fn test_next_height() {
    let rng = fastrand::Rng::with_seed(10);
    let (service, _) = mainnet();
    let chain = mainnet_chain(&service, 3, &rng);
    let next = gen::unsolved_chain(&chain[3].header, 2, 0x1d00ffff, &rng);

    assert_eq!(service.next_height(&genesis::mainnet()).unwrap(), Some(0));
    assert_eq!(service.next_height(&next[0]).unwrap(), Some(4));
    assert_eq!(service.next_height(&next[1]).unwrap(), None);
}

#[quickcheck]
fn prop_chain_invariants(tree: arbitrary::Tree) -> bool {
    let recorder = Recorder::default();
    let service = ChainService::new(Memory::new(), Network::Regtest, recorder);
    service.initialize(genesis::regtest()).unwrap();

    for header in &tree.headers {
        let (_, outcome) = service.add(*header);
        assert_eq!(outcome, AddOutcome::Inserted);
    }
    let store = service.store();
    let tip = store.tip().unwrap().unwrap();
    let mut longest = 0;

    for header in &tree.headers {
        let stored = store.get_by_hash(&header.block_hash()).unwrap().unwrap();
        // Every parent arrived eventually.
        assert_ne!(stored.state, HeaderState::Orphan);

        let parent = store.get_by_hash(&stored.prev_blockhash).unwrap().unwrap();
        assert_eq!(stored.height, parent.height + 1);
        assert_eq!(
            stored.cumulated_work,
            parent.cumulated_work + work::work(stored.bits)
        );
        assert!(stored.cumulated_work <= tip.cumulated_work);

        if stored.state == HeaderState::Longest {
            assert_eq!(parent.state, HeaderState::Longest);
            assert_eq!(
                store
                    .get_by_height_in_state(stored.height, HeaderState::Longest)
                    .unwrap()
                    .unwrap()
                    .hash,
                stored.hash
            );
            longest += 1;
        }
    }
    assert_eq!(longest, tip.height);
    assert_eq!(
        store.longest_chain_from(0).unwrap().len(),
        tip.height as usize + 1
    );
    true
}

/// A store that fails on demand.
#[derive(Debug, Default)]
struct Faulty {
    inner: Memory,
    /// Fail branch switches with a conflict.
    fail_switch: AtomicBool,
    /// Number of creates that fail with an I/O error.
    failing_creates: AtomicU32,
}

impl Store for Faulty {
    fn create(&self, header: StoredHeader) -> Result<Created, StoreError> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "disk unavailable").into());
        }
        self.inner.create(header)
    }
    fn create_batch(&self, headers: Vec<StoredHeader>) -> Result<usize, StoreError> {
        self.inner.create_batch(headers)
    }
    fn update_state(&self, hashes: &[BlockHash], state: HeaderState) -> Result<(), StoreError> {
        self.inner.update_state(hashes, state)
    }
    fn switch_branch(&self, stale: &[BlockHash], longest: &[BlockHash]) -> Result<(), StoreError> {
        if self.fail_switch.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict(String::from("injected failure")));
        }
        self.inner.switch_branch(stale, longest)
    }
    fn adopt(&self, header: StoredHeader) -> Result<(), StoreError> {
        self.inner.adopt(header)
    }
    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StoreError> {
        self.inner.get_by_hash(hash)
    }
    fn get_by_height_in_state(
        &self,
        height: Height,
        state: HeaderState,
    ) -> Result<Option<StoredHeader>, StoreError> {
        self.inner.get_by_height_in_state(height, state)
    }
    fn get_by_height_range(&self, from: Height, to: Height) -> Result<Vec<StoredHeader>, StoreError> {
        self.inner.get_by_height_range(from, to)
    }
    fn longest_chain_from(&self, height: Height) -> Result<Vec<StoredHeader>, StoreError> {
        self.inner.longest_chain_from(height)
    }
    fn stale_chain_back_from(&self, hash: &BlockHash) -> Result<Vec<StoredHeader>, StoreError> {
        self.inner.stale_chain_back_from(hash)
    }
    fn previous(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StoreError> {
        self.inner.previous(hash)
    }
    fn tip(&self) -> Result<Option<StoredHeader>, StoreError> {
        self.inner.tip()
    }
    fn all_tips(&self) -> Result<Vec<StoredHeader>, StoreError> {
        self.inner.all_tips()
    }
    fn ancestor_on_height(
        &self,
        hash: &BlockHash,
        height: Height,
    ) -> Result<Option<StoredHeader>, StoreError> {
        self.inner.ancestor_on_height(hash, height)
    }
    fn chain_between(
        &self,
        low: &BlockHash,
        high: &BlockHash,
    ) -> Result<Vec<StoredHeader>, StoreError> {
        self.inner.chain_between(low, high)
    }
    fn orphans_of(&self, hash: &BlockHash) -> Result<Vec<StoredHeader>, StoreError> {
        self.inner.orphans_of(hash)
    }
    fn count(&self) -> Result<usize, StoreError> {
        self.inner.count()
    }
    fn height(&self) -> Result<Height, StoreError> {
        self.inner.height()
    }
    fn genesis_exists(&self) -> Result<bool, StoreError> {
        self.inner.genesis_exists()
    }
    fn locator_heights(
        &self,
        hashes: &[BlockHash],
        stop: &BlockHash,
    ) -> Result<(Vec<Height>, Height), StoreError> {
        self.inner.locator_heights(hashes, stop)
    }
    fn merkle_root_confirmation(
        &self,
        merkle_root: &MerkleRoot,
        height: Height,
        tip_height: Height,
    ) -> Result<Option<StoredHeader>, StoreError> {
        self.inner.merkle_root_confirmation(merkle_root, height, tip_height)
    }
    fn sync(&self) -> Result<(), StoreError> {
        self.inner.sync()
    }
}

#[test]
fn test_failed_reorg_leaves_chain_intact() {
    let rng = fastrand::Rng::with_seed(11);
    let service = ChainService::new(Faulty::default(), Network::Mainnet, Recorder::default());
    service.initialize(genesis::mainnet()).unwrap();

    let genesis = genesis::mainnet();
    let chain = gen::unsolved_chain(&genesis, 4, genesis.bits, &rng);
    for header in &chain {
        service.add(*header);
    }
    let tip = service.tip().unwrap().unwrap();
    let fork = gen::unsolved_chain(&chain[0], 3, HEAVY_BITS, &rng);

    service.add(fork[0]);
    service.store().fail_switch.store(true, Ordering::SeqCst);

    let (stored, outcome) = service.add(fork[1]);
    assert_eq!(outcome, AddOutcome::ChainUpdateFailed);
    assert_eq!(stored.state, HeaderState::Stale);
    assert_eq!(service.tip().unwrap().unwrap(), tip);

    // A later header on the same branch retries the reorg.
    service.store().fail_switch.store(false, Ordering::SeqCst);

    let (stored, outcome) = service.add(fork[2]);
    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(stored.state, HeaderState::Longest);
    assert_eq!(service.tip().unwrap().unwrap().hash, fork[2].block_hash());
}

#[test]
fn test_transient_storage_failures() {
    let rng = fastrand::Rng::with_seed(12);
    let service = ChainService::new(Faulty::default(), Network::Mainnet, Recorder::default());
    service.initialize(genesis::mainnet()).unwrap();

    let headers = gen::unsolved_chain(&genesis::mainnet(), 2, 0x1d00ffff, &rng);

    service.store().failing_creates.store(2, Ordering::SeqCst);
    assert_eq!(service.add(headers[0]).1, AddOutcome::Inserted);

    service
        .store()
        .failing_creates
        .store(MAX_STORAGE_RETRIES + 1, Ordering::SeqCst);
    assert_eq!(service.add(headers[1]).1, AddOutcome::CreateFailed);
    assert!(service.get(&headers[1].block_hash()).unwrap().is_none());
}
