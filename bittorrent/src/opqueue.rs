//! Process-wide operation queue: rate-limits and fairly distributes the
//! connect/announce slots every torrent competes for, so `BtEngine` adding
//! several torrents at once doesn't thundering-herd a low-capacity daemon.
//! Token-bucket style throttling mirrors the connect-timeout/retry pacing
//! `tracker/udp.rs` already does per-tracker; here it is centralized across
//! every torrent instead.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::ID;

pub const DEFAULT_RATE_PER_SEC: u32 = 20;
pub const DEFAULT_BURST: u32 = 40;
pub const DEFAULT_DRAIN_TICK: Duration = Duration::from_millis(50);

/// One daemon-bound action a torrent can request a slot for. Priority order
/// (lowest first) is the order a torrent consumes its own pending ops in:
/// get connected before worrying about announcing, and uTP (reserved, no
/// transport implemented yet) comes last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    TcpConnect,
    UdpAnnounce,
    HttpAnnounce,
    UtpConnect,
}

impl OpKind {
    fn priority(self) -> u8 {
        match self {
            OpKind::TcpConnect => 0,
            OpKind::UdpAnnounce | OpKind::HttpAnnounce => 1,
            OpKind::UtpConnect => 2,
        }
    }
}

#[derive(Debug, Default)]
struct PendingOps {
    counts: HashMap<OpKind, u32>,
}

impl PendingOps {
    fn next_kind(&self) -> Option<OpKind> {
        self.counts
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&kind, _)| kind)
            .min_by_key(|k| k.priority())
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32, burst: u32, now: Instant) -> Self {
        Self {
            capacity: burst as f64,
            tokens: burst as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// `pendingOps: {torrentHash → {type → count}}` plus the round-robin index,
/// exactly as specified: a `VecDeque` rotated on every grant is the index.
#[derive(Debug)]
pub struct OpQueue {
    bucket: TokenBucket,
    pending: HashMap<ID, PendingOps>,
    order: VecDeque<ID>,
}

impl OpQueue {
    pub fn new(rate_per_sec: u32, burst: u32, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(rate_per_sec, burst, now),
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// `requestDaemonOps`: queues `n` more operations of `kind` for `hash`.
    pub fn request(&mut self, hash: ID, kind: OpKind, n: u32) {
        if n == 0 {
            return;
        }
        if !self.pending.contains_key(&hash) {
            self.order.push_back(hash);
        }
        *self.pending.entry(hash).or_default().counts.entry(kind).or_insert(0) += n;
    }

    /// `cancelDaemonOps`: clears all pending ops for a torrent, e.g. on stop.
    pub fn cancel(&mut self, hash: ID) {
        self.pending.remove(&hash);
        self.order.retain(|h| *h != hash);
    }

    pub fn has_pending(&self, hash: ID) -> bool {
        self.pending.get(&hash).map(|p| p.next_kind().is_some()).unwrap_or(false)
    }

    /// One 50ms drain: if a token is available, walks the round-robin order
    /// for the first torrent with pending work and grants it the
    /// highest-priority op it's waiting on, advancing the round-robin index
    /// past that torrent regardless of whether it had pending work so a
    /// permanently-idle torrent doesn't get checked on every tick. Returns
    /// `None` if no token is available or no torrent has pending ops.
    pub fn drain_tick(&mut self, now: Instant) -> Option<(ID, OpKind)> {
        if !self.bucket.try_take(now) {
            return None;
        }
        for _ in 0..self.order.len() {
            let Some(&hash) = self.order.front() else { break };
            self.order.rotate_left(1);
            if let Some(kind) = self.pending.get(&hash).and_then(PendingOps::next_kind) {
                return Some((hash, kind));
            }
        }
        None
    }

    /// Commits a grant returned by `drain_tick` once the caller has
    /// actually performed the op, decrementing its count.
    pub fn consume(&mut self, hash: ID, kind: OpKind) {
        let Some(ops) = self.pending.get_mut(&hash) else { return };
        if let Some(count) = ops.counts.get_mut(&kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ops.counts.remove(&kind);
            }
        }
        if ops.counts.is_empty() {
            self.pending.remove(&hash);
            self.order.retain(|h| h != &hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> ID {
        [b; 20]
    }

    #[test]
    fn drain_grants_tcp_connect_before_announces() {
        let now = Instant::now();
        let mut queue = OpQueue::new(20, 40, now);
        let h = hash(1);
        queue.request(h, OpKind::HttpAnnounce, 1);
        queue.request(h, OpKind::TcpConnect, 1);

        let (granted, kind) = queue.drain_tick(now).unwrap();
        assert_eq!(granted, h);
        assert_eq!(kind, OpKind::TcpConnect);
    }

    #[test]
    fn round_robins_across_torrents_with_pending_work() {
        let now = Instant::now();
        let mut queue = OpQueue::new(20, 40, now);
        let (a, b) = (hash(1), hash(2));
        queue.request(a, OpKind::TcpConnect, 5);
        queue.request(b, OpKind::TcpConnect, 5);

        let (first, _) = queue.drain_tick(now).unwrap();
        queue.consume(first, OpKind::TcpConnect);
        let (second, _) = queue.drain_tick(now).unwrap();

        assert_ne!(first, second, "round robin should move to the other torrent");
    }

    #[test]
    fn token_bucket_respects_burst_then_refills_over_time() {
        let now = Instant::now();
        let mut queue = OpQueue::new(20, 2, now);
        let h = hash(1);
        queue.request(h, OpKind::TcpConnect, 10);

        assert!(queue.drain_tick(now).is_some());
        queue.consume(h, OpKind::TcpConnect);
        assert!(queue.drain_tick(now).is_some());
        queue.consume(h, OpKind::TcpConnect);
        // Burst of 2 exhausted; immediately retrying at the same instant fails.
        assert!(queue.drain_tick(now).is_none());

        let later = now + Duration::from_millis(100);
        assert!(queue.drain_tick(later).is_some());
    }

    #[test]
    fn cancel_clears_pending_ops_so_drain_skips_the_torrent() {
        let now = Instant::now();
        let mut queue = OpQueue::new(20, 40, now);
        let h = hash(1);
        queue.request(h, OpKind::TcpConnect, 1);
        queue.cancel(h);
        assert!(!queue.has_pending(h));
        assert!(queue.drain_tick(now).is_none());
    }

    #[test]
    fn consume_drops_torrent_once_no_pending_ops_remain() {
        let now = Instant::now();
        let mut queue = OpQueue::new(20, 40, now);
        let h = hash(1);
        queue.request(h, OpKind::TcpConnect, 1);
        let (granted, kind) = queue.drain_tick(now).unwrap();
        queue.consume(granted, kind);
        assert!(!queue.has_pending(h));
    }
}
