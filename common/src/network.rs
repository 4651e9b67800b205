//! Peer network. Eg. *Mainnet*.
use std::fmt;
use std::str::FromStr;

use crate::block::{checkpoints, genesis, BlockHash, BlockHeader, Height};

/// Peer network.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Mainnet.
    #[default]
    Mainnet,
    /// Testnet.
    Testnet,
    /// Regression test net.
    Regtest,
    /// Simulation net.
    Simnet,
}

/// Mainnet headers that are rejected regardless of their work.
const MAINNET_IGNORED: &[&str] = &[
    // First block of the August 2017 chain split.
    "000000000000000000651ef99cb9fcbe0dadde1d424bd9f15ff20136191a5eec",
];

impl Network {
    /// Return the default listen port for the network.
    pub fn port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
            Network::Simnet => 18555,
        }
    }

    /// Get the network magic number for this network. Sent little-endian.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 0xd9b4bef9,
            Network::Testnet => 0x0709110b,
            Network::Regtest => 0xdab5bffa,
            Network::Simnet => 0x12141c16,
        }
    }

    /// Blockchain checkpoints, in ascending height.
    pub fn checkpoints(&self) -> Vec<(Height, BlockHash)> {
        let list = match self {
            Network::Mainnet => checkpoints::MAINNET,
            Network::Testnet => checkpoints::TESTNET,
            Network::Regtest => checkpoints::REGTEST,
            Network::Simnet => checkpoints::SIMNET,
        };
        list.iter()
            .filter_map(|(height, hash)| BlockHash::from_str(hash).ok().map(|h| (*height, h)))
            .collect()
    }

    /// Headers that must be rejected on this network.
    pub fn ignored_blocks(&self) -> Vec<BlockHash> {
        let list: &[&str] = match self {
            Network::Mainnet => MAINNET_IGNORED,
            Network::Testnet | Network::Regtest | Network::Simnet => &[],
        };
        list.iter()
            .filter_map(|hash| BlockHash::from_str(hash).ok())
            .collect()
    }

    /// Return the short string representation of this network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Simnet => "simnet",
        }
    }

    /// DNS seeds. Used to bootstrap the address book.
    pub fn seeds(&self) -> &[&str] {
        match self {
            Network::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
                "seed.bitcoin.sprovoost.nl",
                "dnsseed.emzy.de",
                "seed.bitcoin.wiz.biz",
            ],
            Network::Testnet => &[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "seed.testnet.bitcoin.sprovoost.nl",
                "testnet-seed.bluematt.me",
            ],
            Network::Regtest | Network::Simnet => &[], // No seeds
        }
    }

    /// Get the genesis block header.
    ///
    /// ```
    /// use headerchain_common::network::Network;
    ///
    /// let network = Network::Mainnet;
    /// let genesis = network.genesis();
    ///
    /// assert_eq!(network.genesis_hash(), genesis.block_hash());
    /// ```
    pub fn genesis(&self) -> BlockHeader {
        match self {
            Network::Mainnet => genesis::mainnet(),
            Network::Testnet => genesis::testnet(),
            Network::Regtest => genesis::regtest(),
            Network::Simnet => genesis::simnet(),
        }
    }

    /// Get the hash of the genesis block of this network.
    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis().block_hash()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            "simnet" => Ok(Self::Simnet),
            _ => Err(format!("unknown network `{}`", s)),
        }
    }
}
