use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;

/// Canonical peer identity used by every map/set in `Swarm`. `SocketAddr`'s
/// own `Display` already renders `a.b.c.d:port` for v4 and `[addr]:port`
/// for v6, so this is the one place that format is produced — nothing else
/// in the crate should hand-format an address for identity purposes.
pub fn address_key(addr: SocketAddr) -> String {
    addr.to_string()
}

/// Ports commonly reserved for other services. A peer advertising one of
/// these (or anything below 1024) is still stored and still connectable,
/// just scored last — see `SwarmPeer::score`.
const SUSPICIOUS_PORTS: &[u16] = &[22, 25, 80, 135, 139, 443, 445, 3389];

pub fn is_suspicious_port(port: u16) -> bool {
    port < 1024 || SUSPICIOUS_PORTS.contains(&port)
}

pub fn is_valid_port(port: u32) -> bool {
    port > 0 && port <= 65535
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    Tracker,
    Dht,
    Pex,
    Lpd,
    Incoming,
    Manual,
}

impl DiscoverySource {
    /// Relative trust used as one term of `SwarmPeer::score`. Incoming
    /// connections proved they can reach us; DHT hints are the least
    /// corroborated.
    fn quality(self) -> i64 {
        match self {
            DiscoverySource::Incoming => 30,
            DiscoverySource::Tracker => 20,
            DiscoverySource::Manual => 15,
            DiscoverySource::Lpd => 10,
            DiscoverySource::Pex => 5,
            DiscoverySource::Dht => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Banned,
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("invalid port: {0}")]
    InvalidPort(u32),
}

fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(5))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(900))
        .with_max_elapsed_time(None)
        .build()
}

#[derive(Debug)]
pub struct SwarmPeer {
    pub address: SocketAddr,
    pub source: DiscoverySource,
    pub discovered_at: Instant,
    pub state: PeerState,

    pub connect_attempts: u32,
    pub connect_failures: u32,
    pub last_connect_attempt: Option<Instant>,
    pub last_connect_success: Option<Instant>,
    pub last_connect_error: Option<String>,

    pub ban_reason: Option<String>,
    pub suspicious_port: bool,

    pub total_downloaded: u64,
    pub total_uploaded: u64,

    backoff: ExponentialBackoff,
    backoff_until: Option<Instant>,
}

impl SwarmPeer {
    fn new(address: SocketAddr, source: DiscoverySource, now: Instant) -> Self {
        Self {
            address,
            source,
            discovered_at: now,
            state: PeerState::Idle,
            connect_attempts: 0,
            connect_failures: 0,
            last_connect_attempt: None,
            last_connect_success: None,
            last_connect_error: None,
            ban_reason: None,
            suspicious_port: is_suspicious_port(address.port()),
            total_downloaded: 0,
            total_uploaded: 0,
            backoff: default_backoff(),
            backoff_until: None,
        }
    }

    pub fn backoff_expired(&self, now: Instant) -> bool {
        self.backoff_until.map(|until| now >= until).unwrap_or(true)
    }

    pub fn is_connectable(&self, now: Instant) -> bool {
        matches!(self.state, PeerState::Idle | PeerState::Failed) && self.backoff_expired(now)
    }

    /// Higher is better. Port/source quality and success history dominate;
    /// a small jitter term keeps `get_connectable_peers` from returning an
    /// identical ordering every call when many peers tie.
    fn score(&self) -> i64 {
        if self.suspicious_port {
            // Still connectable, just sorted behind everything else.
            return i64::MIN + self.source.quality();
        }
        let mut s = self.source.quality() * 100;
        s += self.last_connect_success.map(|_| 200).unwrap_or(0);
        s -= (self.connect_failures as i64) * 50;
        if let Some(last) = self.last_connect_attempt {
            if last.elapsed() < Duration::from_secs(60) {
                s -= 25;
            }
        }
        s += rand::thread_rng().gen_range(0..10);
        s
    }
}

/// Single map of known peers plus two key sets that make `connecting_count`
/// and `connected_count` O(1) and, more importantly, the *only* place that
/// tracks those counts — there is deliberately no parallel pending-set
/// anywhere else in the crate.
#[derive(Debug, Default)]
pub struct Swarm {
    peers: HashMap<String, SwarmPeer>,
    connecting: HashSet<String>,
    connected: HashSet<String>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&SwarmPeer> {
        self.peers.get(&address_key(addr))
    }

    fn set_state(&mut self, key: &str, state: PeerState) {
        self.connecting.remove(key);
        self.connected.remove(key);
        match state {
            PeerState::Connecting => {
                self.connecting.insert(key.to_string());
            }
            PeerState::Connected => {
                self.connected.insert(key.to_string());
            }
            _ => {}
        }
        if let Some(peer) = self.peers.get_mut(key) {
            peer.state = state;
        }
    }

    /// Idempotent: the first source to report a peer wins, later reports of
    /// the same address are no-ops. Rejects ports outside 1..=65535 outright
    /// rather than storing them; suspicious-but-valid ports are kept and
    /// just scored last.
    pub fn add_peer(
        &mut self,
        addr: SocketAddr,
        source: DiscoverySource,
        now: Instant,
    ) -> Result<(), SwarmError> {
        if !is_valid_port(addr.port() as u32) {
            return Err(SwarmError::InvalidPort(addr.port() as u32));
        }
        let key = address_key(addr);
        self.peers.entry(key).or_insert_with(|| SwarmPeer::new(addr, source, now));
        Ok(())
    }

    /// Incoming connections are accepted unconditionally, bypassing the
    /// port validation `add_peer` applies to discovered-but-unconnected
    /// addresses — the peer already proved reachability by connecting to us.
    pub fn add_incoming(&mut self, addr: SocketAddr, now: Instant) {
        let key = address_key(addr);
        self.peers
            .entry(key.clone())
            .or_insert_with(|| SwarmPeer::new(addr, DiscoverySource::Incoming, now));
        self.set_state(&key, PeerState::Connected);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.last_connect_success = Some(now);
        }
    }

    pub fn mark_connecting(&mut self, addr: SocketAddr, now: Instant) {
        let key = address_key(addr);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.connect_attempts += 1;
            peer.last_connect_attempt = Some(now);
        }
        self.set_state(&key, PeerState::Connecting);
    }

    pub fn mark_connected(&mut self, addr: SocketAddr, now: Instant) {
        let key = address_key(addr);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.last_connect_success = Some(now);
            peer.connect_failures = 0;
            peer.backoff.reset();
            peer.backoff_until = None;
        }
        self.set_state(&key, PeerState::Connected);
    }

    pub fn mark_failed(&mut self, addr: SocketAddr, reason: String, now: Instant) {
        let key = address_key(addr);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.connect_failures += 1;
            peer.last_connect_error = Some(reason);
            let delay = peer.backoff.next_backoff().unwrap_or(Duration::from_secs(900));
            peer.backoff_until = Some(now + delay);
        }
        self.set_state(&key, PeerState::Failed);
    }

    /// Back to `Idle` so the peer is reconsidered on the next sweep, unless
    /// it's banned — a ban is terminal until the caller explicitly clears it
    /// by re-adding the peer (not currently exposed, since nothing unbans).
    pub fn mark_disconnected(&mut self, addr: SocketAddr) {
        let key = address_key(addr);
        self.connecting.remove(&key);
        self.connected.remove(&key);
        if let Some(peer) = self.peers.get_mut(&key) {
            if peer.state != PeerState::Banned {
                peer.state = PeerState::Idle;
            }
        }
    }

    pub fn ban(&mut self, addr: SocketAddr, reason: String) {
        let key = address_key(addr);
        self.connecting.remove(&key);
        self.connected.remove(&key);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.state = PeerState::Banned;
            peer.ban_reason = Some(reason);
        }
    }

    pub fn record_traffic(&mut self, addr: SocketAddr, downloaded: u64, uploaded: u64) {
        if let Some(peer) = self.peers.get_mut(&address_key(addr)) {
            peer.total_downloaded += downloaded;
            peer.total_uploaded += uploaded;
        }
    }

    /// Candidates for `Torrent::connect_to_peers`: not already connecting,
    /// connected, or banned, and past their backoff window, ranked by
    /// `SwarmPeer::score` (descending) so the best-looking peers are tried
    /// first. Suspicious-port peers are still included, just always last.
    pub fn get_connectable_peers(&self, limit: usize, now: Instant) -> Vec<SocketAddr> {
        let mut candidates: Vec<&SwarmPeer> =
            self.peers.values().filter(|p| p.is_connectable(now)).collect();
        candidates.sort_by_key(|p| std::cmp::Reverse(p.score()));
        candidates.into_iter().take(limit).map(|p| p.address).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn addr4(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(203, 0, 113, 5).into(), port)
    }

    fn addr6(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).into(), port)
    }

    #[test]
    fn address_key_matches_spec_format_for_v4_and_v6() {
        assert_eq!(address_key(addr4(6881)), "203.0.113.5:6881");
        assert_eq!(address_key(addr6(6881)), "[2001:db8::1]:6881");
    }

    #[test]
    fn add_peer_is_idempotent_first_source_wins() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr4(6881);
        swarm.add_peer(a, DiscoverySource::Tracker, now).unwrap();
        swarm.add_peer(a, DiscoverySource::Dht, now).unwrap();
        assert_eq!(swarm.len(), 1);
        assert_eq!(swarm.get(a).unwrap().source, DiscoverySource::Tracker);
    }

    #[test]
    fn add_peer_rejects_invalid_ports() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let err = swarm.add_peer(addr4(0), DiscoverySource::Tracker, now).unwrap_err();
        assert!(matches!(err, SwarmError::InvalidPort(0)));
    }

    #[test]
    fn suspicious_ports_are_flagged_but_still_stored_and_connectable() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr4(443);
        swarm.add_peer(a, DiscoverySource::Tracker, now).unwrap();
        assert!(swarm.get(a).unwrap().suspicious_port);
        assert_eq!(swarm.get_connectable_peers(10, now), vec![a]);
    }

    #[test]
    fn suspicious_ports_rank_behind_normal_ports() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let normal = addr4(51413);
        let suspicious = addr4(443);
        swarm.add_peer(suspicious, DiscoverySource::Tracker, now).unwrap();
        swarm.add_peer(normal, DiscoverySource::Tracker, now).unwrap();
        let ranked = swarm.get_connectable_peers(2, now);
        assert_eq!(ranked, vec![normal, suspicious]);
    }

    #[test]
    fn connecting_and_connected_counts_track_state_transitions() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr4(6881);
        swarm.add_peer(a, DiscoverySource::Tracker, now).unwrap();

        swarm.mark_connecting(a, now);
        assert_eq!(swarm.connecting_count(), 1);
        assert_eq!(swarm.connected_count(), 0);

        swarm.mark_connected(a, now);
        assert_eq!(swarm.connecting_count(), 0);
        assert_eq!(swarm.connected_count(), 1);

        swarm.mark_disconnected(a);
        assert_eq!(swarm.connecting_count(), 0);
        assert_eq!(swarm.connected_count(), 0);
        assert_eq!(swarm.get(a).unwrap().state, PeerState::Idle);
    }

    #[test]
    fn failed_connect_applies_backoff() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr4(6881);
        swarm.add_peer(a, DiscoverySource::Tracker, now).unwrap();
        swarm.mark_connecting(a, now);
        swarm.mark_failed(a, "timeout".into(), now);

        assert_eq!(swarm.get(a).unwrap().state, PeerState::Failed);
        assert!(!swarm.get(a).unwrap().backoff_expired(now));
        assert!(swarm.get_connectable_peers(10, now).is_empty());

        let later = now + Duration::from_secs(3600);
        assert!(swarm.get(a).unwrap().backoff_expired(later));
        assert_eq!(swarm.get_connectable_peers(10, later), vec![a]);
    }

    #[test]
    fn incoming_connections_are_accepted_unconditionally() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr4(443);
        swarm.add_incoming(a, now);
        assert_eq!(swarm.connected_count(), 1);
        assert_eq!(swarm.get(a).unwrap().source, DiscoverySource::Incoming);
    }

    #[test]
    fn banned_peers_are_never_connectable() {
        let mut swarm = Swarm::new();
        let now = Instant::now();
        let a = addr4(6881);
        swarm.add_peer(a, DiscoverySource::Tracker, now).unwrap();
        swarm.ban(a, "hash mismatch".into());
        assert!(swarm.get_connectable_peers(10, now).is_empty());
        swarm.mark_disconnected(a);
        assert_eq!(swarm.get(a).unwrap().state, PeerState::Banned);
    }
}
