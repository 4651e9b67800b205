//! Difficulty targets and chain work.
use primitive_types::U256;

use super::Bits;

/// Difficulty target of a block.
pub type Target = U256;

/// Block work.
pub type Work = U256;

/// Decode a compact difficulty encoding into a target.
///
/// Negative and overflowing encodings decode to a zero target.
pub fn target(bits: Bits) -> Target {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return U256::zero();
    }
    let overflow = exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32);
    if overflow {
        return U256::zero();
    }

    if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from(mantissa) << (8 * (exponent - 3))
    }
}

/// Expected number of hashes needed to produce a header with the given bits,
/// ie. `2^256 / (target + 1)`.
///
/// ```
/// use headerchain_common::block::work::{work, Work};
///
/// assert_eq!(work(0x1d00ffff), Work::from(4_295_032_833u64));
/// assert_eq!(work(0x1b04864c), Work::from(62_209_952_899_966u64));
/// ```
pub fn work(bits: Bits) -> Work {
    let target = target(bits);

    if target.is_zero() {
        return U256::zero();
    }
    // 2^256 doesn't fit; use (~target / (target + 1)) + 1, which is equal.
    (!target / (target + U256::one())) + U256::one()
}

/// Encode work as 32 big-endian bytes.
pub fn to_bytes(work: &Work) -> [u8; 32] {
    let mut buf = [0u8; 32];
    work.to_big_endian(&mut buf);
    buf
}

/// Decode work from 32 big-endian bytes.
pub fn from_bytes(bytes: &[u8; 32]) -> Work {
    U256::from_big_endian(bytes)
}
