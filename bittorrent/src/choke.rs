use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use crate::p2p::state::SessionState;

pub const UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);
pub const OPTIMISTIC_UNCHOKE_INTERVAL: Duration = Duration::from_secs(30);
pub const SNUB_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_UNCHOKE_SLOTS: usize = 4;

/// One peer's inputs to a choking round. Built by `Torrent` from its own
/// `peers` map and `TorrentCommand::PeerState` bookkeeping — this module
/// never reaches into a session task itself.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub address: SocketAddr,
    pub state: SessionState,
}

/// Tit-for-tat unchoke rotation plus a single optimistic-unchoke slot, per
/// peer stats alone — no transport access, so it's driven from `Torrent`'s
/// periodic tick and tested without a network.
#[derive(Debug)]
pub struct ChokeAlgorithm {
    unchoke_slots: usize,
    last_rotation: Option<Instant>,
    last_optimistic: Option<Instant>,
    optimistic_peer: Option<SocketAddr>,
}

impl Default for ChokeAlgorithm {
    fn default() -> Self {
        Self {
            unchoke_slots: DEFAULT_UNCHOKE_SLOTS,
            last_rotation: None,
            last_optimistic: None,
            optimistic_peer: None,
        }
    }
}

impl ChokeAlgorithm {
    pub fn new(unchoke_slots: usize) -> Self {
        Self {
            unchoke_slots,
            ..Default::default()
        }
    }

    /// Peers that must be choked right now regardless of rotation timing:
    /// unchoked but silent for `SNUB_TIMEOUT`. Checked every tick, not just
    /// on the 10s/30s rotation boundaries.
    pub fn snubbed(&self, peers: &[PeerSnapshot], now: Instant) -> Vec<SocketAddr> {
        peers
            .iter()
            .filter(|p| !p.state.choked)
            .filter(|p| {
                let last = p.state.last_useful_exchange.or(p.state.connect_time);
                last.map(|t| now.saturating_duration_since(t) >= SNUB_TIMEOUT)
                    .unwrap_or(false)
            })
            .map(|p| p.address)
            .collect()
    }

    /// Runs the 10s rotation and 30s optimistic-unchoke checks if due,
    /// returning the complete set of peers that should be unchoked this
    /// round (callers choke everyone else). Ranks interested peers by
    /// download rate while leeching, upload rate while seeding.
    pub fn evaluate(
        &mut self,
        peers: &[PeerSnapshot],
        seeding: bool,
        now: Instant,
    ) -> HashSet<SocketAddr> {
        let due_rotation = self
            .last_rotation
            .map(|t| now.duration_since(t) >= UNCHOKE_INTERVAL)
            .unwrap_or(true);
        let due_optimistic = self
            .last_optimistic
            .map(|t| now.duration_since(t) >= OPTIMISTIC_UNCHOKE_INTERVAL)
            .unwrap_or(true);

        if due_rotation {
            self.last_rotation = Some(now);
        }
        if due_optimistic {
            self.last_optimistic = Some(now);
            self.optimistic_peer = peers
                .iter()
                .filter(|p| p.state.peer_interested && p.state.choked)
                .map(|p| p.address)
                .choose(&mut rand::thread_rng());
        }

        let mut interested: Vec<&PeerSnapshot> =
            peers.iter().filter(|p| p.state.peer_interested).collect();
        interested.sort_by_key(|p| {
            let rate = if seeding {
                p.state.throughput.up.rate(Duration::from_secs(2))
            } else {
                p.state.throughput.down.rate(Duration::from_secs(2))
            };
            std::cmp::Reverse(rate)
        });

        let mut unchoked: HashSet<SocketAddr> = interested
            .iter()
            .take(self.unchoke_slots)
            .map(|p| p.address)
            .collect();

        if let Some(optimistic) = self.optimistic_peer {
            if peers.iter().any(|p| p.address == optimistic) {
                unchoked.insert(optimistic);
            }
        }

        unchoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ThroughputStats;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    fn interested_peer(port: u16, down_bytes: u64, now: Instant) -> PeerSnapshot {
        let mut state = SessionState::default();
        state.peer_interested = true;
        state.choked = true;
        let mut throughput = ThroughputStats::default();
        throughput.down.add(down_bytes, now);
        state.throughput = throughput;
        PeerSnapshot { address: addr(port), state }
    }

    #[test]
    fn top_downloaders_get_unchoke_slots() {
        let mut choke = ChokeAlgorithm::new(1);
        let now = Instant::now();
        let fast = interested_peer(1, 10_000, now);
        let slow = interested_peer(2, 10, now);
        let unchoked = choke.evaluate(&[fast, slow], false, now);
        assert!(unchoked.contains(&addr(1)));
        assert!(!unchoked.contains(&addr(2)) || unchoked.len() > 1);
    }

    #[test]
    fn optimistic_unchoke_picks_an_interested_choked_peer() {
        let mut choke = ChokeAlgorithm::new(0);
        let now = Instant::now();
        let peer = interested_peer(1, 0, now);
        let unchoked = choke.evaluate(&[peer], false, now);
        assert_eq!(unchoked.len(), 1);
    }

    #[test]
    fn snubbing_flags_silent_unchoked_peers() {
        let now = Instant::now();
        let mut state = SessionState::default();
        state.choked = false;
        state.connect_time = Some(now - Duration::from_secs(120));
        let snubbed_peer = PeerSnapshot { address: addr(1), state };

        let mut fresh_state = SessionState::default();
        fresh_state.choked = false;
        fresh_state.connect_time = Some(now);
        let fresh_peer = PeerSnapshot { address: addr(2), state: fresh_state };

        let choke = ChokeAlgorithm::default();
        let snubbed = choke.snubbed(&[snubbed_peer, fresh_peer], now);
        assert_eq!(snubbed, vec![addr(1)]);
    }
}
