//! Block-related types and functions.
pub mod checkpoints;
pub mod genesis;
pub mod store;
pub mod time;
pub mod work;

pub use bitcoin::blockdata::block::BlockHeader;
pub use bitcoin::hash_types::{BlockHash, TxMerkleNode};

pub use work::{Target, Work};

/// Merkle root of the transactions committed to by a block.
pub type MerkleRoot = TxMerkleNode;

/// Compact difficulty bits (target) of a block.
pub type Bits = u32;

/// Height of a block.
pub type Height = i32;

/// Block time (seconds since Epoch).
pub type BlockTime = u32;

/// Check that a header's hash satisfies the target encoded in its own `bits`.
///
/// Headers with a negative, zero or overflowing target never pass.
pub fn validate_pow(header: &BlockHeader) -> bool {
    if work::target(header.bits).is_zero() {
        return false;
    }
    header.validate_pow(&header.target()).is_ok()
}

/// Get the locator indexes starting from a given height, and going backwards, exponentially
/// backing off after the first eleven entries. Always ends with the genesis height.
///
/// ```
/// use headerchain_common::block;
///
/// assert_eq!(block::locators_indexes(0), vec![0]);
/// assert_eq!(block::locators_indexes(8), vec![8, 7, 6, 5, 4, 3, 2, 1, 0]);
/// assert_eq!(block::locators_indexes(99), vec![
///     99, 98, 97, 96, 95, 94, 93, 92, 91, 90, 89, 88, 86, 82, 74, 58, 26, 0
/// ]);
/// ```
pub fn locators_indexes(from: Height) -> Vec<Height> {
    let mut indexes = Vec::new();
    let mut height = from.max(0);
    let mut step: Height = 1;

    loop {
        indexes.push(height);

        if height == 0 {
            break;
        }
        height = height.saturating_sub(step).max(0);

        if indexes.len() > 10 {
            step = step.saturating_mul(2);
        }
    }
    indexes
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::consensus::encode::{deserialize, serialize};
    use bitcoin_hashes::Hash;
    use quickcheck_macros::quickcheck;
    use std::str::FromStr;

    #[quickcheck]
    fn prop_locator_size(height: u32) -> bool {
        let tip = (height % 2_000_000) as Height;
        let indexes = locators_indexes(tip);
        let expected = std::cmp::min(
            tip as usize + 1,
            12 + (31 - ((tip - 10).max(1) as u32).leading_zeros()) as usize,
        );

        indexes.len() == expected && indexes.last() == Some(&0)
    }

    #[test]
    fn test_locator_indexes_descending() {
        for tip in [0, 1, 10, 11, 12, 13, 100, 799_999] {
            let indexes = locators_indexes(tip);

            assert_eq!(indexes[0], tip);
            assert!(indexes.windows(2).all(|w| w[0] > w[1]));
        }
    }

    #[test]
    fn test_header_wire_size() {
        let header = genesis::mainnet();
        let bytes = serialize(&header);

        assert_eq!(bytes.len(), 80);
        assert_eq!(deserialize::<BlockHeader>(&bytes).unwrap(), header);
    }

    #[test]
    fn test_hash_display() {
        let s = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = BlockHash::from_str(s).unwrap();

        assert_eq!(hash.to_string(), s);
        assert_eq!(hash.as_inner()[31], 0x00);
        assert_eq!(hash.as_inner()[0], 0x6f);
        assert!(BlockHash::from_str("00ff").is_err());
    }

    #[test]
    fn test_validate_pow_rejects_bad_bits() {
        let mut header = genesis::regtest();
        assert!(validate_pow(&header));

        // Sign bit set.
        header.bits = 0x20ffffff;
        assert!(!validate_pow(&header));

        // Far harder than the regtest header was solved for.
        header.bits = 0x1d00ffff;
        assert!(!validate_pow(&header));
    }
}
