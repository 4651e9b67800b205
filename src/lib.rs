//! Headerchain is a block-headers-only proof-of-work node.
//!
//! The project is broken down into the following crates:
//!
//! * [`node`]: the node runtime, configuration and query handle
//! * [`p2p`]: the wire protocol and header synchronization
//! * [`chain`]: header storage, state assignment and reorganization
//! * [`common`]: common functionality used by all crates
//!
//! The [`node`] crate is the entry point for most users of the library.

#[cfg(feature = "headerchain-chain")]
pub use headerchain_chain as chain;
#[cfg(feature = "headerchain-common")]
pub use headerchain_common as common;
#[cfg(feature = "headerchain-node")]
pub use headerchain_node as node;
#[cfg(feature = "headerchain-p2p")]
pub use headerchain_p2p as p2p;

#[cfg(test)]
pub use headerchain_test as test;
