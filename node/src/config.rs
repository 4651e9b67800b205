//! Node configuration.
//!
//! Every option has a default. A JSON file may override any subset of them:
//!
//! ```json
//! {
//!   "network": "testnet",
//!   "root": "/var/lib/headerchain",
//!   "connect": ["127.0.0.1:18333"],
//!   "p2p": { "target_outbound_peers": 4, "ban_duration": 3600 },
//!   "merkleroot": { "max_block_height_excess": 6 },
//!   "storage": { "batch_size": 500 }
//! }
//! ```
//!
//! Durations are given in seconds.
use std::env;
use std::fs;
use std::net;
use std::path::{Path, PathBuf};

use microserde as serde;
use serde::json::{Number, Object, Value};

use headerchain_chain::merkle::DEFAULT_MAX_EXCESS;
use headerchain_common::block::time::LocalDuration;
use headerchain_common::block::Height;
use headerchain_common::network::Network;
use headerchain_p2p as p2p;

use crate::error::Error;

/// Merkle root confirmation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRootConfig {
    /// Heights past the tip for which requests are unverifiable rather than invalid.
    pub max_block_height_excess: Height,
}

impl Default for MerkleRootConfig {
    fn default() -> Self {
        Self {
            max_block_height_excess: DEFAULT_MAX_EXCESS,
        }
    }
}

/// Header store options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Headers written per transaction when storing in bulk.
    pub batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory. Each network gets its own sub-directory.
    pub root: PathBuf,
    /// Peer-to-peer options, including the network.
    pub p2p: p2p::Config,
    /// Merkle root confirmation options.
    pub merkleroot: MerkleRootConfig,
    /// Header store options.
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(env::var("HOME").unwrap_or_default()).join(".headerchain"),
            p2p: p2p::Config::default(),
            merkleroot: MerkleRootConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// The network to connect to.
    pub fn network(&self) -> Network {
        self.p2p.network
    }

    /// Directory holding this network's header store and address cache.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(self.network().as_str())
    }

    /// Load a configuration file, overriding the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let s = fs::read_to_string(path.as_ref())?;
        let mut cfg = Self::default();

        cfg.merge(&s)?;

        Ok(cfg)
    }

    /// Override options with the ones set in a JSON document.
    pub fn merge(&mut self, json: &str) -> Result<(), Error> {
        let value: Value = serde::json::from_str(json)
            .map_err(|_| Error::Config(String::from("invalid JSON")))?;
        let obj = object(&value, "configuration")?;

        if let Some(network) = string(obj, "network")? {
            self.p2p.network = network
                .parse()
                .map_err(|_| Error::Config(format!("unknown network {:?}", network)))?;
        }
        if let Some(root) = string(obj, "root")? {
            self.root = PathBuf::from(root);
        }
        if let Some(connect) = obj.get("connect") {
            let Value::Array(addrs) = connect else {
                return Err(Error::Config(String::from("`connect` must be an array")));
            };
            self.p2p.connect = addrs
                .iter()
                .map(|v| match v {
                    Value::String(s) => s
                        .parse::<net::SocketAddr>()
                        .map_err(|_| Error::Config(format!("invalid peer address {:?}", s))),
                    _ => Err(Error::Config(String::from("peer addresses must be strings"))),
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(p2p) = obj.get("p2p") {
            let p2p = object(p2p, "p2p")?;
            let cfg = &mut self.p2p;

            if let Some(secs) = uint(p2p, "ban_duration")? {
                cfg.ban_duration = LocalDuration::from_secs(secs);
            }
            if let Some(b) = boolean(p2p, "disable_checkpoints")? {
                cfg.disable_checkpoints = b;
            }
            if let Some(n) = uint(p2p, "blocks_for_fork_confirmation")? {
                cfg.blocks_for_fork_confirmation = height(n)?;
            }
            if let Some(secs) = uint(p2p, "default_connect_timeout")? {
                cfg.connect_timeout = LocalDuration::from_secs(secs);
            }
            if let Some(n) = uint(p2p, "max_peers")? {
                cfg.max_peers = n as usize;
            }
            if let Some(n) = uint(p2p, "max_peers_per_ip")? {
                cfg.max_peers_per_ip = n as usize;
            }
            if let Some(n) = uint(p2p, "min_sync_peer_network_speed")? {
                cfg.min_sync_peer_network_speed = n;
            }
            if let Some(n) = uint(p2p, "target_outbound_peers")? {
                cfg.target_outbound_peers = n as usize;
            }
            if let Some(n) = uint(p2p, "excessive_block_size")? {
                cfg.excessive_block_size = n;
            }
            if let Some(secs) = uint(p2p, "ping_interval")? {
                cfg.ping_interval = LocalDuration::from_secs(secs);
            }
        }
        if let Some(merkleroot) = obj.get("merkleroot") {
            let merkleroot = object(merkleroot, "merkleroot")?;

            if let Some(n) = uint(merkleroot, "max_block_height_excess")? {
                self.merkleroot.max_block_height_excess = height(n)?;
            }
        }
        if let Some(storage) = obj.get("storage") {
            let storage = object(storage, "storage")?;

            if let Some(n) = uint(storage, "batch_size")? {
                if n == 0 {
                    return Err(Error::Config(String::from("`batch_size` must be positive")));
                }
                self.storage.batch_size = n as usize;
            }
        }
        Ok(())
    }
}

fn object<'a>(value: &'a Value, name: &str) -> Result<&'a Object, Error> {
    match value {
        Value::Object(obj) => Ok(obj),
        _ => Err(Error::Config(format!("`{}` must be an object", name))),
    }
}

fn string<'a>(obj: &'a Object, key: &str) -> Result<Option<&'a str>, Error> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(Error::Config(format!("`{}` must be a string", key))),
    }
}

fn uint(obj: &Object, key: &str) -> Result<Option<u64>, Error> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(Number::U64(n))) => Ok(Some(*n)),
        Some(_) => Err(Error::Config(format!(
            "`{}` must be a non-negative integer",
            key
        ))),
    }
}

fn boolean(obj: &Object, key: &str) -> Result<Option<bool>, Error> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::Config(format!("`{}` must be a boolean", key))),
    }
}

fn height(n: u64) -> Result<Height, Error> {
    Height::try_from(n).map_err(|_| Error::Config(format!("height {} is out of range", n)))
}
