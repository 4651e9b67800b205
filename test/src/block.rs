//! Header generators and fixtures.
pub use headerchain_common::block::*;

use headerchain_common::bitcoin_hashes::Hash;

/// Bits of the lowest possible difficulty, as used on regtest.
pub const REGTEST_BITS: Bits = 0x207fffff;

/// Solve a header's proof of work puzzle.
pub fn solve(header: &mut BlockHeader) {
    while !validate_pow(header) {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// Mainnet block at height 1.
pub fn mainnet_block_1() -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: genesis::mainnet().block_hash(),
        merkle_root: "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098"
            .parse()
            .unwrap(),
        time: 1231469665,
        bits: 0x1d00ffff,
        nonce: 2573394689,
    }
}

pub mod gen {
    use super::*;

    /// Generate a random merkle root.
    pub fn merkle_root(rng: &fastrand::Rng) -> MerkleRoot {
        let mut bytes = [0u8; 32];
        for b in bytes.iter_mut() {
            *b = rng.u8(..);
        }
        MerkleRoot::from_inner(bytes)
    }

    /// Generate a header on top of `prev_header` with the given bits, without solving it.
    pub fn unsolved(prev_header: &BlockHeader, bits: Bits, rng: &fastrand::Rng) -> BlockHeader {
        let target_spacing = 60 * 10; // 10 minutes.
        let delta = rng.u32(target_spacing - 60..target_spacing + 60);

        BlockHeader {
            version: 1,
            prev_blockhash: prev_header.block_hash(),
            merkle_root: merkle_root(rng),
            time: prev_header.time + delta,
            bits,
            nonce: rng.u32(..),
        }
    }

    /// Generate a solved header on top of `prev_header`, at regtest difficulty.
    pub fn header(prev_header: &BlockHeader, rng: &fastrand::Rng) -> BlockHeader {
        let mut header = unsolved(prev_header, REGTEST_BITS, rng);
        solve(&mut header);

        header
    }

    /// Generate a chain of `length` solved headers on top of `parent`. The parent
    /// is not included.
    pub fn chain(parent: &BlockHeader, length: usize, rng: &fastrand::Rng) -> Vec<BlockHeader> {
        let mut prev_header = *parent;
        let mut chain = Vec::with_capacity(length);

        for _ in 0..length {
            let header = header(&prev_header, rng);
            prev_header = header;

            chain.push(header);
        }
        chain
    }

    /// Generate a chain of `length` unsolved headers with the given bits.
    pub fn unsolved_chain(
        parent: &BlockHeader,
        length: usize,
        bits: Bits,
        rng: &fastrand::Rng,
    ) -> Vec<BlockHeader> {
        let mut prev_header = *parent;
        let mut chain = Vec::with_capacity(length);

        for _ in 0..length {
            let header = unsolved(&prev_header, bits, rng);
            prev_header = header;

            chain.push(header);
        }
        chain
    }
}

pub mod arbitrary {
    use quickcheck::{Arbitrary, Gen};

    use super::*;

    /// Bits used for generated trees, so that branches carry different work.
    const BITS: [Bits; 3] = [REGTEST_BITS, 0x1f7fffff, 0x1e7fffff];

    /// A random tree of unsolved headers on top of the regtest genesis, in the
    /// order they should be inserted. The genesis itself is not included.
    #[derive(Debug, Clone)]
    pub struct Tree {
        /// Headers, in insertion order.
        pub headers: Vec<BlockHeader>,
    }

    impl Arbitrary for Tree {
        fn arbitrary(g: &mut Gen) -> Self {
            let rng = fastrand::Rng::with_seed(u64::arbitrary(g));
            let genesis = genesis::regtest();
            let size = g.size().min(48);
            let mut headers: Vec<BlockHeader> = Vec::with_capacity(size);

            for _ in 0..size {
                let parent = if headers.is_empty() || rng.u8(..) < 64 {
                    let ix = rng.usize(..=headers.len());
                    if ix == headers.len() {
                        genesis
                    } else {
                        headers[ix]
                    }
                } else {
                    headers[headers.len() - 1]
                };
                let bits = BITS[rng.usize(..BITS.len())];

                headers.push(gen::unsolved(&parent, bits, &rng));
            }
            // Occasionally deliver headers out of order, producing orphans.
            if bool::arbitrary(g) && headers.len() > 2 {
                let i = rng.usize(..headers.len() - 1);
                headers.swap(i, i + 1);
            }
            Self { headers }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mainnet_block_1() {
        let header = mainnet_block_1();

        assert!(validate_pow(&header));
        assert_eq!(
            header.block_hash().to_string(),
            "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048"
        );
    }

    #[test]
    fn test_generated_chain_links() {
        let rng = fastrand::Rng::with_seed(7);
        let genesis = genesis::regtest();
        let chain = gen::chain(&genesis, 8, &rng);

        assert_eq!(chain[0].prev_blockhash, genesis.block_hash());
        assert!(chain.windows(2).all(|w| w[1].prev_blockhash == w[0].block_hash()));
        assert!(chain.iter().all(validate_pow));
    }
}
