//! Peer liveness.
use headerchain_common::block::time::{LocalDuration, LocalTime};

/// Default time between pings.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_mins(2);

/// Number of ping intervals without a `pong` before the peer is considered dead.
const MAX_MISSED_INTERVALS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingPong { nonce: u64, since: LocalTime },
    Idle { since: LocalTime },
}

/// What the peer should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing.
    None,
    /// Send a `ping` with this nonce.
    Ping(u64),
    /// The peer is unresponsive.
    Timeout,
}

/// Pings one peer and tracks its `pong`s.
#[derive(Debug)]
pub struct Pinger {
    state: State,
    interval: LocalDuration,
    /// Last measured round-trip time.
    latency: Option<LocalDuration>,
    rng: fastrand::Rng,
}

impl Pinger {
    /// Create a pinger. The first ping is due one interval after `now`.
    pub fn new(interval: LocalDuration, rng: fastrand::Rng, now: LocalTime) -> Self {
        Self {
            state: State::Idle { since: now },
            interval,
            latency: None,
            rng,
        }
    }

    /// Last measured round-trip time.
    pub fn latency(&self) -> Option<LocalDuration> {
        self.latency
    }

    /// Advance the clock.
    pub fn tick(&mut self, now: LocalTime) -> Action {
        match self.state {
            State::AwaitingPong { since, .. } => {
                // A ping was sent and we're waiting for a `pong`. If too much
                // time has passed, we consider this peer dead.
                if now - since >= self.interval * MAX_MISSED_INTERVALS {
                    Action::Timeout
                } else {
                    Action::None
                }
            }
            State::Idle { since } => {
                if now - since >= self.interval {
                    let nonce = self.rng.u64(..);
                    self.state = State::AwaitingPong { nonce, since: now };

                    Action::Ping(nonce)
                } else {
                    Action::None
                }
            }
        }
    }

    /// Process a `pong`. Returns whether it answered our last ping.
    pub fn received_pong(&mut self, nonce: u64, now: LocalTime) -> bool {
        match self.state {
            State::AwaitingPong {
                nonce: last_nonce,
                since,
            } if nonce == last_nonce => {
                self.latency = Some(now - since);
                self.state = State::Idle { since: now };

                true
            }
            // Unsolicited or redundant `pong`. Ignore.
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ping_pong() {
        let mut time = LocalTime::from_secs(1_000_000);
        let mut pinger = Pinger::new(PING_INTERVAL, fastrand::Rng::with_seed(1), time);

        assert_eq!(pinger.tick(time), Action::None);

        time.elapse(PING_INTERVAL);
        let Action::Ping(nonce) = pinger.tick(time) else {
            panic!("expected a ping");
        };
        assert_eq!(pinger.tick(time), Action::None);
        assert!(!pinger.received_pong(nonce.wrapping_add(1), time));

        time.elapse(LocalDuration::from_secs(3));
        assert!(pinger.received_pong(nonce, time));
        assert_eq!(pinger.latency(), Some(LocalDuration::from_secs(3)));
        assert!(!pinger.received_pong(nonce, time));
    }

    #[test]
    fn test_timeout_after_two_intervals() {
        let mut time = LocalTime::from_secs(1_000_000);
        let mut pinger = Pinger::new(PING_INTERVAL, fastrand::Rng::with_seed(2), time);

        time.elapse(PING_INTERVAL);
        assert!(matches!(pinger.tick(time), Action::Ping(_)));

        time.elapse(PING_INTERVAL);
        assert_eq!(pinger.tick(time), Action::None);

        time.elapse(PING_INTERVAL);
        assert_eq!(pinger.tick(time), Action::Timeout);
    }
}
