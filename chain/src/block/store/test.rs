//! Repository contract tests, run against every backend.
use headerchain_common::bitcoin_hashes::Hash;
use headerchain_common::block::store::{Created, Error, HeaderState, Store, StoredHeader};
use headerchain_common::block::{genesis, work, BlockHash, BlockHeader};

use headerchain_test::block::gen;

use super::{File, Memory};

fn stored(header: BlockHeader, parent: &StoredHeader, state: HeaderState) -> StoredHeader {
    StoredHeader::new(
        header,
        parent.height + 1,
        state,
        parent.cumulated_work + work::work(header.bits),
    )
}

/// Genesis plus `len` longest headers.
fn longest_chain(store: &dyn Store, len: usize, rng: &fastrand::Rng) -> Vec<StoredHeader> {
    let genesis = StoredHeader::genesis(genesis::regtest());
    let mut chain = vec![genesis.clone()];

    for header in gen::chain(&genesis.header, len, rng) {
        let parent = chain.last().unwrap();
        let next = stored(header, parent, HeaderState::Longest);

        chain.push(next);
    }
    store.create_batch(chain.clone()).unwrap();
    chain
}

fn backends() -> Vec<(Box<dyn Store>, Option<tempfile::TempDir>)> {
    let tmp = tempfile::tempdir().unwrap();
    let file = File::create(tmp.path().join("headers.db")).unwrap();

    vec![(Box::new(Memory::new()), None), (Box::new(file), Some(tmp))]
}

#[test]
fn test_create_is_idempotent() {
    let rng = fastrand::Rng::with_seed(1);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 3, &rng);

        assert_eq!(
            store.create(chain[2].clone()).unwrap(),
            Created::AlreadyExists
        );
        assert_eq!(store.count().unwrap(), 4);
        assert_eq!(store.height().unwrap(), 3);
        assert!(store.genesis_exists().unwrap());
    }
}

#[test]
fn test_longest_height_is_unique() {
    let rng = fastrand::Rng::with_seed(2);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 2, &rng);
        let fork = gen::chain(&chain[0].header, 1, &rng);
        let competitor = stored(fork[0], &chain[0], HeaderState::Longest);

        assert!(matches!(
            store.create(competitor.clone()),
            Err(Error::Conflict(_))
        ));
        assert!(store.get_by_hash(&competitor.hash).unwrap().is_none());

        let competitor = StoredHeader {
            state: HeaderState::Stale,
            ..competitor
        };
        store.create(competitor.clone()).unwrap();

        assert_eq!(
            store
                .get_by_height_in_state(1, HeaderState::Stale)
                .unwrap()
                .unwrap(),
            competitor
        );
        assert_eq!(
            store
                .get_by_height_in_state(1, HeaderState::Longest)
                .unwrap()
                .unwrap(),
            chain[1]
        );
        assert_eq!(store.get_by_height_range(1, 1).unwrap().len(), 2);
    }
}

#[test]
fn test_batch_is_all_or_nothing() {
    let rng = fastrand::Rng::with_seed(3);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 1, &rng);
        let headers = gen::chain(&chain[1].header, 2, &rng);
        let a = stored(headers[0], &chain[1], HeaderState::Longest);
        // Not linked to anything stored.
        let b = StoredHeader {
            height: 7,
            ..stored(headers[1], &a, HeaderState::Longest)
        };

        assert!(store.create_batch(vec![a.clone(), b]).is_err());
        assert!(store.get_by_hash(&a.hash).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 2);
    }
}

#[test]
fn test_switch_branch() {
    let rng = fastrand::Rng::with_seed(4);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 3, &rng);
        let fork = gen::chain(&chain[1].header, 3, &rng);
        let mut branch = vec![];
        let mut parent = chain[1].clone();

        for header in fork {
            let next = stored(header, &parent, HeaderState::Stale);
            store.create(next.clone()).unwrap();
            branch.push(next.clone());
            parent = next;
        }
        let tip = branch.last().unwrap().clone();

        assert_eq!(store.stale_chain_back_from(&tip.hash).unwrap().len(), 3);
        assert_eq!(store.all_tips().unwrap().len(), 2);
        assert_eq!(store.previous(&branch[0].hash).unwrap().unwrap(), chain[1]);

        // Promoting the branch without demoting the old one conflicts.
        let hashes = branch.iter().map(|h| h.hash).collect::<Vec<_>>();
        assert!(store.update_state(&hashes, HeaderState::Longest).is_err());
        assert_eq!(store.tip().unwrap().unwrap(), chain[3]);

        let old = store
            .longest_chain_from(2)
            .unwrap()
            .iter()
            .map(|h| h.hash)
            .collect::<Vec<_>>();
        store.switch_branch(&old, &hashes).unwrap();

        let tip = store.tip().unwrap().unwrap();
        assert_eq!(tip.hash, branch[2].hash);
        assert_eq!(tip.height, 4);

        for h in &chain[2..] {
            assert_eq!(
                store.get_by_hash(&h.hash).unwrap().unwrap().state,
                HeaderState::Stale
            );
        }
        let longest = store.longest_chain_from(0).unwrap();
        assert_eq!(longest.len(), tip.height as usize + 1);
        assert!(longest.windows(2).all(|w| w[1].prev_blockhash == w[0].hash));
    }
}

#[test]
fn test_queries() {
    let rng = fastrand::Rng::with_seed(5);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 20, &rng);
        let tip = &chain[20];

        assert_eq!(
            store.ancestor_on_height(&tip.hash, 5).unwrap().unwrap(),
            chain[5]
        );
        assert!(store.ancestor_on_height(&tip.hash, 21).unwrap().is_none());

        let between = store.chain_between(&chain[3].hash, &chain[7].hash).unwrap();
        assert_eq!(between, chain[3..=7].to_vec());
        assert!(store
            .chain_between(&chain[7].hash, &chain[3].hash)
            .unwrap()
            .is_empty());

        let unknown = BlockHash::hash(b"unknown");
        let (heights, stop) = store
            .locator_heights(&[chain[9].hash, unknown], &chain[12].hash)
            .unwrap();
        assert_eq!(heights, vec![9, 0]);
        assert_eq!(stop, 12);

        let root = chain[4].merkle_root;
        assert_eq!(
            store
                .merkle_root_confirmation(&root, 4, 20)
                .unwrap()
                .unwrap()
                .hash,
            chain[4].hash
        );
        assert!(store.merkle_root_confirmation(&root, 5, 20).unwrap().is_none());
        assert!(store.merkle_root_confirmation(&root, 4, 3).unwrap().is_none());
    }
}

#[test]
fn test_orphans() {
    let rng = fastrand::Rng::with_seed(6);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 1, &rng);
        let headers = gen::chain(&chain[1].header, 2, &rng);
        let orphan = StoredHeader::new(
            headers[1],
            0,
            HeaderState::Orphan,
            Default::default(),
        );
        store.create(orphan.clone()).unwrap();

        assert_eq!(store.orphans_of(&headers[0].block_hash()).unwrap(), vec![orphan.clone()]);
        assert!(store.all_tips().unwrap().contains(&orphan));

        let parent = stored(headers[0], &chain[1], HeaderState::Longest);
        store.create(parent.clone()).unwrap();

        let adopted = stored(headers[1], &parent, HeaderState::Longest);
        store.adopt(adopted.clone()).unwrap();

        assert_eq!(store.tip().unwrap().unwrap(), adopted);
        assert!(store.orphans_of(&parent.hash).unwrap().is_empty());
        assert!(matches!(store.adopt(adopted), Err(Error::Conflict(_))));
    }
}

#[test]
fn test_rejected_tips() {
    let rng = fastrand::Rng::with_seed(7);

    for (store, _tmp) in backends() {
        let chain = longest_chain(store.as_ref(), 2, &rng);
        let rejected = StoredHeader::rejected(BlockHash::hash(b"rejected"));

        store.create(rejected.clone()).unwrap();

        let tips = store.all_tips().unwrap();
        assert_eq!(tips.len(), 2);
        assert!(tips.contains(&chain[2]));
        assert!(tips.contains(&rejected));
    }
}
