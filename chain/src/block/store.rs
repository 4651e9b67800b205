//! Header storage backends.

pub use headerchain_common::block::store::*;

pub mod index;
pub mod io;
pub mod memory;

pub use io::File;
pub use memory::Memory;

#[cfg(test)]
mod test;
