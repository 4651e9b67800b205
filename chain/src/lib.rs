//! Header storage, chain selection and reorganization.
#![allow(clippy::len_without_is_empty)]
#![deny(unsafe_code, missing_debug_implementations)]
#![warn(missing_docs)]
pub mod block;
pub mod event;
pub mod merkle;

pub use block::service::{AddOutcome, ChainService};
pub use event::{Broadcast, HeaderAdded, Publisher};
