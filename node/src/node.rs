//! Node process and query handle.
use std::fs;
use std::sync::{Arc, RwLock};

use crossbeam_channel as chan;
use log::*;

use headerchain_chain::block::checkpoints::CheckpointGate;
use headerchain_chain::block::store::{self, StoredHeader};
use headerchain_chain::merkle::{Confirmation, MerkleRootRequest};
use headerchain_chain::{Broadcast, ChainService, HeaderAdded};
use headerchain_common::block::time::{AdjustedTime, LocalTime};
use headerchain_common::block::{BlockHash, Height};
use headerchain_p2p::protocol::peer::Clock;
use headerchain_p2p::Reactor;

use crate::config::Config;
use crate::error::Error;

/// Name of the header store file.
pub const HEADERS_FILE: &str = "headers.db";
/// Name of the address cache file.
pub const PEERS_FILE: &str = "peers.json";

/// A header node process.
#[derive(Debug)]
pub struct Node {
    config: Config,
    pub(crate) chain: Arc<ChainService<store::File>>,
    events: Broadcast<HeaderAdded>,
    checkpoints: Arc<CheckpointGate>,
    clock: Clock,
    shutdown: (chan::Sender<()>, chan::Receiver<()>),
}

impl Node {
    /// Open the header store and initialize the chain.
    pub fn new(config: Config) -> Result<Self, Error> {
        let network = config.network();
        let dir = config.data_dir();

        fs::create_dir_all(&dir)?;

        info!(target: "node", "Initializing node ({})..", network);
        info!(target: "node", "Genesis block hash is {}", network.genesis_hash());

        let path = dir.join(HEADERS_FILE);
        let store = store::File::open(&path)?.batch_size(config.storage.batch_size);

        if store.check().is_err() {
            warn!(target: "node", "Corruption detected in header store, healing..");
            // Rolls the store back to the last valid record.
            store.heal()?;
        }
        let events = Broadcast::new();
        let chain = ChainService::new(store, network, events.clone());

        chain.initialize(network.genesis())?;

        let height = chain.height()?;
        let checkpoints = if config.p2p.disable_checkpoints {
            info!(target: "node", "Checkpoints are disabled");
            CheckpointGate::disabled()
        } else {
            CheckpointGate::new(network.checkpoints(), height)
        };
        info!(target: "node", "Header store {:?} opened at height {}", path, height);

        Ok(Self {
            config,
            chain: Arc::new(chain),
            events,
            checkpoints: Arc::new(checkpoints),
            clock: Arc::new(RwLock::new(AdjustedTime::new())),
            shutdown: chan::unbounded(),
        })
    }

    /// Create a handle to query and stop the node.
    pub fn handle(&self) -> Handle {
        Handle {
            chain: self.chain.clone(),
            events: self.events.clone(),
            checkpoints: self.checkpoints.clone(),
            clock: self.clock.clone(),
            shutdown: self.shutdown.0.clone(),
            max_excess: self.config.merkleroot.max_block_height_excess,
        }
    }

    /// Run the node until [`Handle::shutdown`] is called. This function is meant to
    /// be run in its own thread.
    pub fn run(self) -> Result<(), Error> {
        let headers = self.events.subscribe();
        // Kept alive until the reactor returns, so that dropping every handle
        // doesn't stop the node.
        let (_shutdown_tx, shutdown) = self.shutdown;

        Reactor::new(self.config.p2p.clone(), self.chain, self.checkpoints, self.clock)
            .peers_file(self.config.data_dir().join(PEERS_FILE))
            .run(headers, shutdown)?;

        info!(target: "node", "Node stopped");

        Ok(())
    }
}

/// Queries a running node.
#[derive(Debug, Clone)]
pub struct Handle {
    chain: Arc<ChainService<store::File>>,
    events: Broadcast<HeaderAdded>,
    checkpoints: Arc<CheckpointGate>,
    clock: Clock,
    shutdown: chan::Sender<()>,
    max_excess: Height,
}

impl Handle {
    /// Tip of the longest chain.
    pub fn tip(&self) -> Result<Option<StoredHeader>, Error> {
        Ok(self.chain.tip()?)
    }

    /// Get a header by hash, in any state.
    pub fn header(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, Error> {
        Ok(self.chain.get(hash)?)
    }

    /// Get the longest-chain header at a height.
    pub fn header_at(&self, height: Height) -> Result<Option<StoredHeader>, Error> {
        Ok(self.chain.get_at(height)?)
    }

    /// Get the ancestor of a header at a height.
    pub fn ancestor(&self, hash: &BlockHash, height: Height) -> Result<Option<StoredHeader>, Error> {
        Ok(self.chain.ancestor(hash, height)?)
    }

    /// Confirm that merkle roots are included in the longest chain.
    pub fn confirm_merkle_roots(
        &self,
        requests: &[MerkleRootRequest],
    ) -> Result<Vec<Confirmation>, Error> {
        Ok(self.chain.confirm_merkle_roots(requests, self.max_excess)?)
    }

    /// Whether the chain is past every checkpoint and its tip is recent.
    pub fn is_current(&self) -> Result<bool, Error> {
        let now = match self.clock.read() {
            Ok(clock) => clock.from(LocalTime::now()),
            Err(poisoned) => poisoned.into_inner().from(LocalTime::now()),
        };
        Ok(self.chain.is_current(self.checkpoints.highest(), now)?)
    }

    /// Subscribe to headers entering the longest chain.
    pub fn subscribe(&self) -> chan::Receiver<HeaderAdded> {
        self.events.subscribe()
    }

    /// Stop the node.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.send(())?;

        Ok(())
    }
}
