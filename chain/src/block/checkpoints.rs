//! Checkpoint gate.
//!
//! Peers consult the gate while downloading headers. The gate tracks the next
//! checkpoint to reach, and only ever moves forward.
use std::sync::RwLock;

use thiserror::Error;

use headerchain_common::block::{BlockHash, Height};

/// A checkpoint error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A header at a checkpoint height has the wrong hash.
    #[error("checkpoint mismatch at height {height}: expected {expected}, got {got}")]
    Mismatch {
        /// Checkpoint height.
        height: Height,
        /// Checkpoint hash.
        expected: BlockHash,
        /// Hash of the offending header.
        got: BlockHash,
    },
    /// A header is above the next checkpoint, which was never passed.
    #[error("checkpoint at height {checkpoint} skipped by header at height {height}")]
    Skipped {
        /// Header height.
        height: Height,
        /// Checkpoint height.
        checkpoint: Height,
    },
}

/// Result of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checked {
    /// The header is the checkpoint at the given height. The gate advanced.
    Passed(Height),
    /// The header isn't at a checkpoint height.
    Unchecked,
}

/// Hard-coded checkpoints, and the position of the next one to reach.
#[derive(Debug)]
pub struct CheckpointGate {
    checkpoints: Vec<(Height, BlockHash)>,
    /// Index of the next checkpoint in `checkpoints`.
    next: RwLock<usize>,
}

impl CheckpointGate {
    /// Create a gate from checkpoints in ascending height order, positioned after
    /// the given tip height.
    pub fn new(mut checkpoints: Vec<(Height, BlockHash)>, tip: Height) -> Self {
        checkpoints.sort_by_key(|(h, _)| *h);
        checkpoints.dedup_by_key(|(h, _)| *h);

        let next = checkpoints.partition_point(|(h, _)| *h <= tip);

        Self {
            checkpoints,
            next: RwLock::new(next),
        }
    }

    /// A gate without checkpoints. Every check passes.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), 0)
    }

    fn position(&self) -> usize {
        // The guarded value is a plain index, so a poisoned lock still holds a
        // usable one.
        match self.next.read() {
            Ok(next) => *next,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// The next checkpoint to reach, if any.
    pub fn next_checkpoint(&self) -> Option<(Height, BlockHash)> {
        self.checkpoints.get(self.position()).copied()
    }

    /// Height of the last checkpoint passed, or zero.
    pub fn last_passed(&self) -> Height {
        self.position()
            .checked_sub(1)
            .and_then(|i| self.checkpoints.get(i))
            .map_or(0, |(h, _)| *h)
    }

    /// Height of the highest checkpoint, or zero if there are none.
    pub fn highest(&self) -> Height {
        self.checkpoints.last().map_or(0, |(h, _)| *h)
    }

    /// Whether all checkpoints were reached.
    pub fn is_complete(&self) -> bool {
        self.position() >= self.checkpoints.len()
    }

    /// Check a header with the given height and hash against the next checkpoint.
    pub fn check(&self, height: Height, hash: &BlockHash) -> Result<Checked, Error> {
        let mut next = match self.next.write() {
            Ok(next) => next,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some((checkpoint, expected)) = self.checkpoints.get(*next).copied() else {
            return Ok(Checked::Unchecked);
        };

        if height < checkpoint {
            Ok(Checked::Unchecked)
        } else if height > checkpoint {
            Err(Error::Skipped { height, checkpoint })
        } else if *hash == expected {
            *next += 1;
            log::info!(target: "chain", "Checkpoint at height {} passed ({})", height, hash);

            Ok(Checked::Passed(height))
        } else {
            Err(Error::Mismatch {
                height,
                expected,
                got: *hash,
            })
        }
    }
}
