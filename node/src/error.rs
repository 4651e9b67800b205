//! Node errors.
use std::io;

use crossbeam_channel as chan;
use thiserror::Error;

use headerchain_chain::block::{service, store};
use headerchain_p2p as p2p;

/// A node error.
#[derive(Error, Debug)]
pub enum Error {
    /// A networking error.
    #[error(transparent)]
    P2p(#[from] p2p::Error),
    /// A chain service error.
    #[error(transparent)]
    Chain(#[from] service::Error),
    /// A header store error.
    #[error("header store: {0}")]
    Store(#[from] store::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// An invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// The node isn't running.
    #[error("node channel disconnected")]
    Channel,
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Channel
    }
}
