//! Peer roster: known controllers, keyed by name and by address.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::protocol::Capabilities;

/// A remote controller known to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub addr: IpAddr,
    pub capabilities: Capabilities,
    /// Most recent inbound traffic from this address.
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(
        name: impl Into<String>,
        addr: IpAddr,
        capabilities: Capabilities,
        now: Instant,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            capabilities,
            last_seen: now,
        }
    }
}

/// Ordered peer list. Insertion order is kept but carries no meaning.
#[derive(Debug, Default)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry sharing the name or the address, then append `peer`.
    /// Returns the number of entries replaced.
    pub fn upsert(&mut self, peer: Peer) -> usize {
        let before = self.peers.len();
        self.peers.retain(|p| p.name != peer.name && p.addr != peer.addr);
        let replaced = before - self.peers.len();
        tracing::info!(
            name = %peer.name,
            addr = %peer.addr,
            replaced,
            known = self.peers.len() + 1,
            "peer controller added"
        );
        self.peers.push(peer);
        replaced
    }

    pub fn all(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.name == name)
    }

    pub fn get_by_addr(&self, addr: IpAddr) -> Option<&Peer> {
        self.peers.iter().find(|p| p.addr == addr)
    }

    /// First peer (in roster order) matching `pred`.
    pub fn find_by_capability<F>(&self, pred: F) -> Option<&Peer>
    where
        F: Fn(&Capabilities) -> bool,
    {
        self.peers.iter().find(|p| pred(&p.capabilities))
    }

    /// Refresh `last_seen` for the peer at `addr`. False if no such peer.
    pub fn touch(&mut self, addr: IpAddr, now: Instant) -> bool {
        match self.peers.iter_mut().find(|p| p.addr == addr) {
            Some(p) => {
                p.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Drop peers not seen for at least `ttl`. Returns the evicted entries.
    pub fn evict_stale(&mut self, now: Instant, ttl: Duration) -> Vec<Peer> {
        let (stale, live): (Vec<Peer>, Vec<Peer>) = std::mem::take(&mut self.peers)
            .into_iter()
            .partition(|p| now.saturating_duration_since(p.last_seen) >= ttl);
        self.peers = live;
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    fn peer(name: &str, last: u8) -> Peer {
        Peer::new(name, ip(last), Capabilities::default(), Instant::now())
    }

    #[test]
    fn reannounce_keeps_single_entry() {
        let mut roster = Roster::new();
        roster.upsert(peer("a", 1));
        roster.upsert(peer("b", 2));
        let replaced = roster.upsert(peer("a", 1));
        assert_eq!(replaced, 1);
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.all().iter().filter(|p| p.name == "a").count(), 1);
        // Replaced entry moves to the end.
        assert_eq!(roster.all()[1].name, "a");
    }

    #[test]
    fn same_name_new_address_replaces() {
        let mut roster = Roster::new();
        roster.upsert(peer("a", 1));
        roster.upsert(peer("a", 9));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("a").unwrap().addr, ip(9));
    }

    #[test]
    fn address_rename_evicts_old_name() {
        let mut roster = Roster::new();
        roster.upsert(peer("old", 1));
        roster.upsert(peer("new", 1));
        assert_eq!(roster.len(), 1);
        assert!(roster.get("old").is_none());
        assert!(roster.get("new").is_some());
    }

    #[test]
    fn upsert_matching_both_keys_removes_two() {
        let mut roster = Roster::new();
        roster.upsert(peer("a", 1));
        roster.upsert(peer("b", 2));
        let replaced = roster.upsert(peer("a", 2));
        assert_eq!(replaced, 2);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn find_by_capability_returns_first_match() {
        let mut roster = Roster::new();
        roster.upsert(peer("plain", 1));
        let weather = Capabilities {
            weather_feed: true,
            ..Default::default()
        };
        roster.upsert(Peer::new("w1", ip(2), weather, Instant::now()));
        roster.upsert(Peer::new("w2", ip(3), weather, Instant::now()));
        let found = roster.find_by_capability(|c| c.weather_feed).unwrap();
        assert_eq!(found.name, "w1");
        assert!(roster.find_by_capability(|c| c.siren).is_none());
    }

    #[test]
    fn touch_and_evict() {
        let start = Instant::now();
        let mut roster = Roster::new();
        roster.upsert(Peer::new("a", ip(1), Capabilities::default(), start));
        roster.upsert(Peer::new("b", ip(2), Capabilities::default(), start));
        let later = start + Duration::from_secs(30);
        assert!(roster.touch(ip(2), later));
        assert!(!roster.touch(ip(7), later));

        let evicted = roster.evict_stale(later, Duration::from_secs(20));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].name, "a");
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.all()[0].name, "b");
    }
}
