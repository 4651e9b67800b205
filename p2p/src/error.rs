//! Peer-to-peer networking errors.
use std::fmt::Debug;
use std::io;

use crossbeam_channel as chan;
use thiserror::Error;

use headerchain_chain::block::service;

use crate::wire;

/// An error occuring in peer-to-peer networking code.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A wire encoding or framing error.
    #[error("wire error: {0}")]
    Wire(#[from] wire::Error),

    /// A chain service error.
    #[error("chain error: {0}")]
    Chain(#[from] service::Error),

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl<T: Debug + Send + Sync + 'static> From<chan::SendError<T>> for Error {
    fn from(err: chan::SendError<T>) -> Self {
        Self::Channel(Box::new(err))
    }
}

impl From<chan::RecvError> for Error {
    fn from(err: chan::RecvError) -> Self {
        Self::Channel(Box::new(err))
    }
}
