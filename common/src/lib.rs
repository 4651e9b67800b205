//! Library of common functionality shared by all crates.
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]
pub mod block;
pub mod collections;
pub mod dns;
pub mod network;

pub use bitcoin;
pub use bitcoin_hashes;
pub use nonempty;
