//! Seed resolution.
use log::debug;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::network::Network;

/// DNS seeds of a network.
#[derive(Debug, Clone)]
pub struct Seeds<'a> {
    /// Seed host names.
    hosts: &'a [&'a str],
    /// The port to connect to on resolved addresses.
    port: u16,
}

impl<'a> Seeds<'a> {
    /// Create a seed list from host names and a port.
    pub fn new(hosts: &'a [&'a str], port: u16) -> Self {
        Self { hosts, port }
    }

    /// The built-in seeds of a network.
    pub fn from_network(network: &'a Network) -> Self {
        Self::new(network.seeds(), network.port())
    }

    /// Resolve every seed. Seeds that fail to resolve are skipped.
    pub fn resolve(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();

        for host in self.hosts {
            match (*host, self.port).to_socket_addrs() {
                Ok(resolved) => {
                    let before = addrs.len();
                    addrs.extend(resolved);

                    debug!(target: "p2p", "Seed {} resolved to {} address(es)", host, addrs.len() - before);
                }
                Err(err) => {
                    debug!(target: "p2p", "Seed {} failed to resolve: {}", host, err);
                }
            }
        }
        addrs
    }
}
