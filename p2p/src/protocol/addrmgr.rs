//!
//! The peer-to-peer address manager.
//!
//! Known addresses live in one of three buckets: free to dial, in use, or
//! banned. Addresses that fail are retried with an exponential backoff, and
//! banned addresses become free again once their ban expires.
//!
use std::path::Path;
use std::{fs, io, net};

use log::*;
use microserde as serde;

use headerchain_common::block::time::{LocalDuration, LocalTime};
use headerchain_common::block::BlockTime;
use headerchain_common::collections::RandomMap;

use crate::wire::ServiceFlags;

/// Delay before retrying an address after its first failure.
pub const MIN_RETRY_BACKOFF: LocalDuration = LocalDuration::from_mins(1);
/// Maximum delay before retrying a failed address.
pub const MAX_RETRY_BACKOFF: LocalDuration = LocalDuration::from_mins(60);

/// Bucket an address is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Available to connect to.
    Free,
    /// Connected, or being connected to.
    Used,
    /// Banned until the given time.
    Banned {
        /// When the ban expires.
        until: LocalTime,
    },
}

/// A known peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAddress {
    /// Services advertised for this address.
    pub services: ServiceFlags,
    /// Last time the address was seen on the network.
    pub last_seen: BlockTime,
    /// Current bucket.
    pub bucket: Bucket,
    /// Consecutive connection failures.
    pub failures: u32,
    /// Don't dial before this time.
    pub retry_at: Option<LocalTime>,
}

impl KnownAddress {
    fn new(services: ServiceFlags, last_seen: BlockTime) -> Self {
        Self {
            services,
            last_seen,
            bucket: Bucket::Free,
            failures: 0,
            retry_at: None,
        }
    }

    /// Convert to a JSON value.
    fn to_json(&self, addr: &net::SocketAddr) -> serde::json::Value {
        use serde::json::{Number, Object, Value};

        let mut obj = Object::new();

        obj.insert("address".to_owned(), Value::String(addr.to_string()));
        let services: u64 = self.services.into();

        obj.insert("services".to_owned(), Value::Number(Number::U64(services)));
        obj.insert(
            "last_seen".to_owned(),
            Value::Number(Number::U64(self.last_seen as u64)),
        );
        obj.insert(
            "banned_until".to_owned(),
            match self.bucket {
                Bucket::Banned { until } => Value::Number(Number::U64(until.as_secs())),
                Bucket::Free | Bucket::Used => Value::Null,
            },
        );

        Value::Object(obj)
    }

    /// Convert from a JSON value.
    fn from_json(v: serde::json::Value) -> Result<(net::SocketAddr, Self), serde::Error> {
        use serde::json::{Number, Value};

        let obj = match v {
            Value::Object(obj) => obj,
            _ => return Err(serde::Error),
        };
        let addr = match obj.get("address") {
            Some(Value::String(addr)) => addr.parse().map_err(|_| serde::Error)?,
            _ => return Err(serde::Error),
        };
        let services = match obj.get("services") {
            Some(Value::Number(Number::U64(srv))) => ServiceFlags::from(*srv),
            _ => return Err(serde::Error),
        };
        let last_seen = match obj.get("last_seen") {
            Some(Value::Number(Number::U64(t))) => *t as BlockTime,
            _ => return Err(serde::Error),
        };
        let bucket = match obj.get("banned_until") {
            Some(Value::Number(Number::U64(t))) => Bucket::Banned {
                until: LocalTime::from_secs(*t),
            },
            Some(Value::Null) | None => Bucket::Free,
            _ => return Err(serde::Error),
        };
        let mut ka = Self::new(services, last_seen);
        ka.bucket = bucket;

        Ok((addr, ka))
    }
}

/// Manages peer network addresses.
#[derive(Debug)]
pub struct AddressManager {
    addrs: RandomMap<net::SocketAddr, KnownAddress>,
    ban_duration: LocalDuration,
}

impl AddressManager {
    /// Create an empty address manager.
    pub fn new(ban_duration: LocalDuration, rng: fastrand::Rng) -> Self {
        Self {
            addrs: RandomMap::new(rng),
            ban_duration,
        }
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether no address is known.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Get a known address.
    pub fn get(&self, addr: &net::SocketAddr) -> Option<&KnownAddress> {
        self.addrs.get(addr)
    }

    /// Whether an address is banned.
    pub fn is_banned(&self, addr: &net::SocketAddr) -> bool {
        matches!(
            self.addrs.get(addr).map(|ka| ka.bucket),
            Some(Bucket::Banned { .. })
        )
    }

    /// Number of free addresses.
    pub fn free(&self) -> usize {
        self.addrs
            .values()
            .filter(|ka| ka.bucket == Bucket::Free)
            .count()
    }

    /// Add an address, or merge it with the one we know.
    pub fn upsert(&mut self, addr: net::SocketAddr, services: ServiceFlags, last_seen: BlockTime) {
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return;
        }
        match self.addrs.get_mut(&addr) {
            Some(ka) => {
                if last_seen > ka.last_seen {
                    ka.last_seen = last_seen;
                    ka.services = services;
                }
            }
            None => {
                self.addrs
                    .insert(addr, KnownAddress::new(services, last_seen));
            }
        }
    }

    /// Pick a random free address that is due for dialing.
    pub fn get_random_free(&self, now: LocalTime) -> Option<net::SocketAddr> {
        self.addrs
            .sample_with(|_, ka| {
                ka.bucket == Bucket::Free && ka.retry_at.map_or(true, |t| t <= now)
            })
            .map(|(addr, _)| *addr)
    }

    /// Move a free address to the used bucket. Returns `false` if it wasn't free.
    pub fn mark_used(&mut self, addr: &net::SocketAddr) -> bool {
        match self.addrs.get_mut(addr) {
            Some(ka) if ka.bucket == Bucket::Free => {
                ka.bucket = Bucket::Used;
                true
            }
            _ => false,
        }
    }

    /// Return an address to the free bucket. If the connection failed, the
    /// address is only dialed again after a backoff.
    pub fn release(&mut self, addr: &net::SocketAddr, failed: bool, now: LocalTime) {
        let Some(ka) = self.addrs.get_mut(addr) else {
            return;
        };
        if ka.bucket != Bucket::Used {
            return;
        }
        ka.bucket = Bucket::Free;

        if failed {
            ka.failures = ka.failures.saturating_add(1);

            let backoff = MIN_RETRY_BACKOFF * 2u64.saturating_pow(ka.failures - 1);
            let backoff = backoff.min(MAX_RETRY_BACKOFF);

            debug!(target: "conn", "{}: Retrying in {}", addr, backoff);

            ka.retry_at = Some(now + backoff);
        } else {
            ka.failures = 0;
            ka.retry_at = None;
        }
    }

    /// Ban an address.
    pub fn ban(&mut self, addr: net::SocketAddr, now: LocalTime) {
        let until = now + self.ban_duration;
        let ka = self
            .addrs
            .entry(addr)
            .or_insert_with(|| KnownAddress::new(ServiceFlags::from(0), now.block_time()));

        info!(target: "conn", "{}: Banned until {}", addr, until);

        ka.bucket = Bucket::Banned { until };
    }

    /// Lift expired bans.
    pub fn tick(&mut self, now: LocalTime) {
        for (addr, ka) in self.addrs.iter_mut() {
            if let Bucket::Banned { until } = ka.bucket {
                if until <= now {
                    debug!(target: "conn", "{}: Ban lifted", addr);

                    ka.bucket = Bucket::Free;
                    ka.failures = 0;
                    ka.retry_at = None;
                }
            }
        }
    }

    /// Load addresses from a file. Loaded addresses are free unless banned.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> io::Result<usize> {
        use serde::json::Value;

        let s = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let val: Value = serde::json::from_str(&s)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        let Value::Array(ary) = val else {
            return Err(io::ErrorKind::InvalidData.into());
        };
        let mut count = 0;

        for v in ary.into_iter() {
            let (addr, ka) = KnownAddress::from_json(v)
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

            self.addrs.insert(addr, ka);
            count += 1;
        }
        Ok(count)
    }

    /// Save addresses to a file, replacing its contents.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        use serde::json::Value;

        let list: serde::json::Array = self
            .addrs
            .iter()
            .map(|(addr, ka)| ka.to_json(addr))
            .collect();
        let s = serde::json::to_string(&Value::Array(list));

        fs::write(path, s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(i: u8) -> net::SocketAddr {
        ([44, 44, 44, i], 8333).into()
    }

    fn srv(n: u64) -> ServiceFlags {
        ServiceFlags::from(n)
    }

    fn addrmgr() -> AddressManager {
        AddressManager::new(LocalDuration::from_mins(24 * 60), fastrand::Rng::with_seed(1))
    }

    #[test]
    fn test_upsert() {
        let mut mgr = addrmgr();

        mgr.upsert(addr(1), srv(1), 100);
        mgr.upsert(addr(1), srv(9), 50);
        assert_eq!(mgr.get(&addr(1)).unwrap().last_seen, 100);
        assert_eq!(mgr.get(&addr(1)).unwrap().services, srv(1));

        mgr.upsert(addr(1), srv(9), 200);
        assert_eq!(mgr.get(&addr(1)).unwrap().last_seen, 200);
        assert_eq!(mgr.get(&addr(1)).unwrap().services, srv(9));

        mgr.upsert(([0, 0, 0, 0], 8333).into(), srv(1), 100);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_buckets() {
        let time = LocalTime::from_secs(1_600_000_000);
        let mut mgr = addrmgr();

        assert_eq!(mgr.get_random_free(time), None);

        mgr.upsert(addr(1), srv(1), 0);
        assert_eq!(mgr.get_random_free(time), Some(addr(1)));
        assert!(mgr.mark_used(&addr(1)));
        assert!(!mgr.mark_used(&addr(1)));
        assert_eq!(mgr.get_random_free(time), None);

        mgr.release(&addr(1), false, time);
        assert_eq!(mgr.get_random_free(time), Some(addr(1)));
    }

    #[test]
    fn test_retry_backoff() {
        let mut time = LocalTime::from_secs(1_600_000_000);
        let mut mgr = addrmgr();

        mgr.upsert(addr(1), srv(1), 0);

        for mins in [1u64, 2, 4, 8, 16, 32, 60, 60] {
            assert!(mgr.mark_used(&addr(1)));
            mgr.release(&addr(1), true, time);

            time.elapse(LocalDuration::from_secs(mins * 60 - 1));
            assert_eq!(mgr.get_random_free(time), None, "backoff of {} minutes", mins);

            time.elapse(LocalDuration::from_secs(1));
            assert_eq!(mgr.get_random_free(time), Some(addr(1)));
        }

        // A successful connection resets the backoff.
        assert!(mgr.mark_used(&addr(1)));
        mgr.release(&addr(1), false, time);
        assert_eq!(mgr.get(&addr(1)).unwrap().failures, 0);
        assert_eq!(mgr.get_random_free(time), Some(addr(1)));
    }

    #[test]
    fn test_ban() {
        let mut time = LocalTime::from_secs(1_600_000_000);
        let mut mgr = addrmgr();

        mgr.upsert(addr(1), srv(1), 0);
        mgr.mark_used(&addr(1));
        mgr.ban(addr(1), time);

        assert!(mgr.is_banned(&addr(1)));
        // Releasing a banned address has no effect.
        mgr.release(&addr(1), true, time);
        assert!(mgr.is_banned(&addr(1)));

        time.elapse(LocalDuration::from_mins(24 * 60 - 1));
        mgr.tick(time);
        assert_eq!(mgr.get_random_free(time), None);

        time.elapse(LocalDuration::from_mins(1));
        mgr.tick(time);
        assert!(!mgr.is_banned(&addr(1)));
        assert_eq!(mgr.get_random_free(time), Some(addr(1)));
    }

    #[test]
    fn test_save_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");
        let time = LocalTime::from_secs(1_600_000_000);
        let mut mgr = addrmgr();

        assert_eq!(mgr.load(&path).unwrap(), 0);

        mgr.upsert(addr(1), srv(1), 100);
        mgr.upsert(addr(2), srv(5), 200);
        mgr.upsert(([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 8333).into(), srv(1), 300);
        mgr.mark_used(&addr(2));
        mgr.ban(addr(3), time);
        mgr.save(&path).unwrap();

        let mut loaded = addrmgr();
        assert_eq!(loaded.load(&path).unwrap(), 4);
        assert_eq!(loaded.get(&addr(2)).unwrap().bucket, Bucket::Free);
        assert_eq!(loaded.get(&addr(2)).unwrap().services, srv(5));
        assert_eq!(
            loaded.get(&addr(3)).unwrap().bucket,
            Bucket::Banned {
                until: time + LocalDuration::from_mins(24 * 60)
            }
        );
        assert_eq!(loaded.free(), 3);
    }

    #[test]
    fn test_load_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");

        fs::write(&path, "{\"not\": \"a list\"}").unwrap();
        assert!(addrmgr().load(&path).is_err());
    }
}
