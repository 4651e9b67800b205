use std::net;
use std::path::PathBuf;

use argh::FromArgs;

use headerchain_node::{logger, Config, Network};

#[derive(FromArgs)]
/// A block-headers-only node.
pub struct Options {
    /// configuration file
    #[argh(option)]
    pub config: Option<PathBuf>,

    /// network to connect to: mainnet, testnet, regtest or simnet
    #[argh(option)]
    pub network: Option<Network>,

    /// connect to the specified peers only
    #[argh(option)]
    pub connect: Vec<net::SocketAddr>,

    /// data directory (default: ~/.headerchain)
    #[argh(option)]
    pub root: Option<PathBuf>,

    /// log level (default: info)
    #[argh(option, default = "log::Level::Info")]
    pub log: log::Level,

    /// don't verify headers against checkpoints
    #[argh(switch)]
    pub disable_checkpoints: bool,
}

impl Options {
    pub fn from_env() -> Self {
        argh::from_env()
    }

    /// Build the node configuration. Flags take precedence over the file.
    fn into_config(self) -> Result<Config, headerchain_node::Error> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(network) = self.network {
            cfg.p2p.network = network;
        }
        if !self.connect.is_empty() {
            cfg.p2p.connect = self.connect;
        }
        if let Some(root) = self.root {
            cfg.root = root;
        }
        if self.disable_checkpoints {
            cfg.p2p.disable_checkpoints = true;
        }
        Ok(cfg)
    }
}

fn main() {
    let opts = Options::from_env();

    if let Err(err) = logger::init(opts.log) {
        eprintln!("error: failed to initialize logger: {}", err);
        std::process::exit(1);
    }

    let result = opts
        .into_config()
        .and_then(headerchain_node::run);

    if let Err(err) = result {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
