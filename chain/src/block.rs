//! Header chain.
pub mod checkpoints;
pub mod service;
pub mod store;
