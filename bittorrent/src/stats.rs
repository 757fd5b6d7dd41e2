use std::time::{Duration, Instant};
use crate::p2p::state::SessionState;

#[derive(Debug, Default)]
pub struct TorrentStats {

    pub start_time: Option<Instant>,

    pub time_elapsed: Duration,

    pub piece_stats: PieceStats,

    pub peer_stats: Vec<PeerStats>,

    pub throughput: ThroughputStats,

}

#[derive(Debug, Default)]
pub struct PieceStats {

    pub num_pieces: usize,

    pub num_pending: usize,

    pub num_downloaded: usize,

}

impl PieceStats {
    pub fn is_seed(&self) -> bool {
        self.num_downloaded == self.num_pieces
    }
}

#[derive(Debug, Clone)]
pub struct PeerStats {

    pub address: std::net::SocketAddr,

    pub state: SessionState,
}

#[derive(Debug, Default, Clone)]
pub struct ThroughputStats {

    pub up: BandwidthTracker,

    pub down: BandwidthTracker,

}

impl ThroughputStats {
    pub fn record(&mut self, now: Instant) {
        self.up.tick(now);
        self.down.tick(now);
    }
}

/// Tiered round-robin bandwidth history, per the design note in `DESIGN.md`:
/// `[(100ms,300), (500ms,240), (2s,240)]`. Tier 0 is the live accumulator;
/// finalizing a tier-N bucket folds its total into the tier-(N+1) bucket
/// that owns the same instant. Consolidation only ever flows one way,
/// coarse tiers are never split back into fine ones.
const TIERS: [(Duration, usize); 3] = [
    (Duration::from_millis(100), 300),
    (Duration::from_millis(500), 240),
    (Duration::from_secs(2), 240),
];

#[derive(Debug, Clone)]
struct Tier {
    bucket_size: Duration,
    buckets: Vec<u64>,
    // Index of the bucket currently being filled.
    head: usize,
    // Start instant of the bucket at `head`.
    head_started: Option<Instant>,
    total: u64,
}

impl Tier {
    fn new(bucket_size: Duration, capacity: usize) -> Self {
        Self {
            bucket_size,
            buckets: vec![0; capacity],
            head: 0,
            head_started: None,
            total: 0,
        }
    }

    /// Adds `n` bytes to the live bucket, returns an overflow amount to fold
    /// into the next coarser tier for every bucket that rolled over.
    fn add(&mut self, n: u64, now: Instant) -> u64 {
        self.total += n;
        let started = *self.head_started.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started);
        let mut carried = 0;
        if elapsed >= self.bucket_size {
            let rolled = (elapsed.as_nanos() / self.bucket_size.as_nanos().max(1)) as usize;
            for _ in 0..rolled.min(self.buckets.len()) {
                carried += self.buckets[self.head];
                self.head = (self.head + 1) % self.buckets.len();
                self.buckets[self.head] = 0;
            }
            self.head_started = Some(now);
        }
        self.buckets[self.head] += n;
        carried
    }

    fn sum(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Clone)]
pub struct BandwidthTracker {
    tiers: Vec<Tier>,
}

impl Default for BandwidthTracker {
    fn default() -> Self {
        Self {
            tiers: TIERS.iter().map(|&(size, cap)| Tier::new(size, cap)).collect(),
        }
    }
}

impl BandwidthTracker {
    pub fn add(&mut self, n: u64, now: Instant) {
        let mut carry = n;
        for tier in self.tiers.iter_mut() {
            carry = tier.add(carry, now);
            if carry == 0 {
                break;
            }
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.add(0, now);
    }

    pub fn total(&self) -> u64 {
        self.tiers.iter().map(|t| t.total).sum()
    }

    /// Instantaneous rate as the sum of buckets in the finest tier whose
    /// bucket size is <= the requested resolution.
    pub fn rate(&self, resolution: Duration) -> u64 {
        let tier = self
            .tiers
            .iter()
            .rev()
            .find(|t| t.bucket_size <= resolution)
            .or_else(|| self.tiers.first());
        match tier {
            Some(t) => {
                let window = t.bucket_size.as_secs_f64() * t.buckets.len() as f64;
                if window > 0.0 {
                    (t.sum() as f64 / window) as u64
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

impl std::ops::AddAssign<u64> for BandwidthTracker {
    fn add_assign(&mut self, n: u64) {
        self.add(n, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_total_across_tiers() {
        let mut tracker = BandwidthTracker::default();
        let t0 = Instant::now();
        for i in 0..10 {
            tracker.add(100, t0 + Duration::from_millis(i * 10));
        }
        assert_eq!(tracker.total(), 1000);
    }

    #[test]
    fn consolidation_is_one_way() {
        let mut tracker = BandwidthTracker::default();
        let t0 = Instant::now();
        // Push well past a full tier-0 window (300 * 100ms = 30s) so a
        // carry folds into tier 1.
        for i in 0..400u64 {
            tracker.add(10, t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(tracker.total(), 4000);
        assert!(tracker.tiers[1].total > 0);
    }
}
