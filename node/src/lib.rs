//! Block-headers-only node.
//!
//! Opens the header store under the data directory, then synchronizes headers
//! from the network until stopped. A [`Handle`] answers queries while it runs.
#![deny(missing_docs, unsafe_code)]
pub mod config;
pub mod error;
pub mod logger;
pub mod node;

pub use config::Config;
pub use error::Error;
pub use node::{Handle, Node};

pub use headerchain_common::network::Network;


/// Run a node with the given configuration, until it fails.
pub fn run(config: Config) -> Result<(), Error> {
    Node::new(config)?.run()
}
