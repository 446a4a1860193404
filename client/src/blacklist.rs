//! Time-bounded exclusion of relay peer IPs.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

pub trait Blacklist: Send + Sync {
    /// Exclude `ip` from future connection attempts for `ttl`.
    fn blacklist(&self, ip: IpAddr, ttl: Duration);
}

/// Entries expire on their own. Reads drop the stale entry they hit and
/// every insert sweeps the rest.
#[derive(Default)]
pub struct IpBlacklist {
    entries: DashMap<IpAddr, Instant>,
}

impl IpBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let now = Instant::now();
        let expired = match self.entries.get(ip) {
            None => return false,
            Some(expiry) => *expiry <= now,
        };
        if expired {
            self.entries.remove_if(ip, |_, expiry| *expiry <= now);
        }
        !expired
    }
}

impl Blacklist for IpBlacklist {
    fn blacklist(&self, ip: IpAddr, ttl: Duration) {
        let now = Instant::now();
        let expiry = now + ttl;
        self.entries.retain(|_, until| *until > now);
        // never shorten an existing exclusion
        self.entries
            .entry(ip)
            .and_modify(|current| *current = (*current).max(expiry))
            .or_insert(expiry);
    }
}
