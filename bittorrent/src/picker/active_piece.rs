use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::block::{block_len, num_blocks, BlockData, BlockRequest};

/// Default cap on the total bytes buffered in memory across all active
/// pieces before the oldest piece is evicted to make room.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {
    #[default]
    Free,
    Requested,
    Received,
}

/// A piece that has at least one block requested or received, buffered
/// entirely in memory until complete and hashed.
#[derive(Debug)]
pub struct ActivePiece {
    pub idx: usize,
    pub len: usize,
    started_at: Instant,
    states: Vec<BlockState>,
    buf: Vec<u8>,
    // Peers that contributed at least one received block to this piece.
    contributors: Vec<SocketAddr>,
    // Peers with an outstanding request for each block, keyed by block index.
    requesters: HashMap<usize, Vec<(SocketAddr, Instant)>>,
}

impl ActivePiece {
    pub fn new(idx: usize, len: usize, now: Instant) -> Self {
        Self {
            idx,
            len,
            started_at: now,
            states: vec![BlockState::default(); num_blocks(len) as usize],
            buf: vec![0u8; len],
            contributors: Vec::new(),
            requesters: HashMap::new(),
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.len
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| *s == BlockState::Received)
    }

    /// Blocks that have never been requested, in sequential order.
    pub fn needed_blocks(&self, max: usize) -> Vec<BlockRequest> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == BlockState::Free)
            .take(max)
            .map(|(i, _)| self.block_info(i))
            .collect()
    }

    /// Already-requested-but-not-yet-received blocks, for endgame duplicate
    /// requesting. Excludes blocks already requested from `exclude_peer`.
    pub fn needed_blocks_endgame(
        &self,
        max: usize,
        max_duplicate_requests: usize,
        exclude_peer: SocketAddr,
    ) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        for (i, state) in self.states.iter().enumerate() {
            if out.len() == max {
                break;
            }
            if *state != BlockState::Requested {
                continue;
            }
            let requesters = self.requesters.get(&i).map(|v| v.len()).unwrap_or(0);
            let already_from_peer = self
                .requesters
                .get(&i)
                .map(|v| v.iter().any(|(p, _)| *p == exclude_peer))
                .unwrap_or(false);
            if requesters < max_duplicate_requests && !already_from_peer {
                out.push(self.block_info(i));
            }
        }
        out
    }

    pub fn add_request(&mut self, block: BlockRequest, peer: SocketAddr, now: Instant) {
        assert_eq!(block.piece_idx, self.idx);
        let i = block.idx_in_piece();
        if self.states[i] == BlockState::Free {
            self.states[i] = BlockState::Requested;
        }
        self.requesters.entry(i).or_default().push((peer, now));
    }

    pub fn free_request(&mut self, block: &BlockRequest) {
        assert_eq!(block.piece_idx, self.idx);
        let i = block.idx_in_piece();
        if self.states[i] == BlockState::Requested {
            self.states[i] = BlockState::Free;
        }
        self.requesters.remove(&i);
    }

    pub fn free_all(&mut self) {
        self.states.iter_mut().for_each(|s| *s = BlockState::Free);
        self.requesters.clear();
    }

    /// Stores a received block. Returns `true` if this block was already
    /// received from a prior (duplicate/endgame) request.
    pub fn add_block(&mut self, block: BlockData, peer: SocketAddr) -> bool {
        assert_eq!(block.piece_idx, self.idx);
        let idx_in_piece = block.offset / crate::BLOCK_SIZE;
        let was_received = self.states[idx_in_piece] == BlockState::Received;
        if !was_received {
            self.buf[block.offset..block.offset + block.data.len()].copy_from_slice(block.data.as_slice());
            self.states[idx_in_piece] = BlockState::Received;
            if !self.contributors.contains(&peer) {
                self.contributors.push(peer);
            }
        }
        self.requesters.remove(&idx_in_piece);
        was_received
    }

    /// Consumes the piece, returning its assembled bytes. Caller must check
    /// `is_complete()` first.
    pub fn assemble(self) -> Vec<u8> {
        self.buf
    }

    pub fn contributing_peers(&self) -> &[SocketAddr] {
        &self.contributors
    }

    /// Peers other than `peer` that also requested the block `idx_in_piece`.
    pub fn other_requesters(&self, idx_in_piece: usize, peer: SocketAddr) -> Vec<SocketAddr> {
        self.requesters
            .get(&idx_in_piece)
            .map(|v| v.iter().filter(|(p, _)| *p != peer).map(|(p, _)| *p).collect())
            .unwrap_or_default()
    }

    /// Requests older than `timeout` are freed so they can be re-picked;
    /// returns the freed block infos.
    pub fn check_timeouts(&mut self, timeout: Duration, now: Instant) -> Vec<BlockRequest> {
        let mut freed = Vec::new();
        let stale: Vec<usize> = self
            .requesters
            .iter()
            .filter(|(_, v)| v.iter().all(|(_, t)| now.saturating_duration_since(*t) > timeout))
            .map(|(i, _)| *i)
            .collect();
        for i in stale {
            if self.states[i] == BlockState::Requested {
                self.states[i] = BlockState::Free;
                self.requesters.remove(&i);
                freed.push(self.block_info(i));
            }
        }
        freed
    }

    fn block_info(&self, idx_in_piece: usize) -> BlockRequest {
        BlockRequest {
            piece_idx: self.idx,
            offset: idx_in_piece * crate::BLOCK_SIZE,
            len: block_len(self.len, idx_in_piece),
        }
    }
}

/// Owns the set of in-flight pieces and enforces `max_buffered_bytes` by
/// evicting the oldest (by start time) active piece when a new piece would
/// push the total over the cap.
#[derive(Debug)]
pub struct ActivePieceManager {
    pieces: HashMap<usize, ActivePiece>,
    max_buffered_bytes: usize,
}

impl ActivePieceManager {
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            pieces: HashMap::new(),
            max_buffered_bytes,
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pieces.values().map(|p| p.buffered_bytes()).sum()
    }

    pub fn get(&self, idx: usize) -> Option<&ActivePiece> {
        self.pieces.get(&idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ActivePiece> {
        self.pieces.get_mut(&idx)
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.pieces.contains_key(&idx)
    }

    pub fn active_indices(&self) -> impl Iterator<Item = &usize> {
        self.pieces.keys()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Starts a new active piece, evicting the stalest one(s) first if the
    /// buffer budget would otherwise be exceeded. Returns the indices of any
    /// pieces evicted so the caller can free their in-flight requests.
    pub fn start(&mut self, idx: usize, piece_len: usize, now: Instant) -> Vec<usize> {
        let mut evicted = Vec::new();
        while self.buffered_bytes() + piece_len > self.max_buffered_bytes && !self.pieces.is_empty() {
            let stalest = self
                .pieces
                .iter()
                .min_by_key(|(_, p)| p.started_at())
                .map(|(i, _)| *i);
            match stalest {
                Some(i) => {
                    self.pieces.remove(&i);
                    evicted.push(i);
                }
                None => break,
            }
        }
        self.pieces.insert(idx, ActivePiece::new(idx, piece_len, now));
        evicted
    }

    pub fn remove(&mut self, idx: usize) -> Option<ActivePiece> {
        self.pieces.remove(&idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn add_block_then_assemble() {
        let now = Instant::now();
        let mut piece = ActivePiece::new(0, crate::BLOCK_SIZE * 2, now);
        let peer = addr(1);
        let b0 = BlockRequest { piece_idx: 0, offset: 0, len: crate::BLOCK_SIZE };
        let b1 = BlockRequest { piece_idx: 0, offset: crate::BLOCK_SIZE, len: crate::BLOCK_SIZE };
        piece.add_request(b0, peer, now);
        piece.add_request(b1, peer, now);
        assert!(!piece.add_block(BlockData { piece_idx: 0, offset: 0, data: vec![1u8; crate::BLOCK_SIZE] }, peer));
        assert!(!piece.is_complete());
        assert!(!piece.add_block(BlockData { piece_idx: 0, offset: crate::BLOCK_SIZE, data: vec![2u8; crate::BLOCK_SIZE] }, peer));
        assert!(piece.is_complete());
        let bytes = piece.assemble();
        assert_eq!(bytes.len(), crate::BLOCK_SIZE * 2);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[crate::BLOCK_SIZE], 2);
    }

    #[test]
    fn duplicate_block_reports_duplicate() {
        let now = Instant::now();
        let mut piece = ActivePiece::new(0, crate::BLOCK_SIZE, now);
        let p1 = addr(1);
        let p2 = addr(2);
        let b0 = BlockRequest { piece_idx: 0, offset: 0, len: crate::BLOCK_SIZE };
        piece.add_request(b0, p1, now);
        piece.add_request(b0, p2, now);
        assert!(!piece.add_block(BlockData { piece_idx: 0, offset: 0, data: vec![0u8; crate::BLOCK_SIZE] }, p1));
        assert!(piece.add_block(BlockData { piece_idx: 0, offset: 0, data: vec![0u8; crate::BLOCK_SIZE] }, p2));
        assert_eq!(piece.contributing_peers(), &[p1]);
    }

    #[test]
    fn manager_evicts_stalest_over_budget() {
        let now = Instant::now();
        let mut mgr = ActivePieceManager::new(crate::BLOCK_SIZE * 2);
        mgr.start(0, crate::BLOCK_SIZE * 2, now);
        let evicted = mgr.start(1, crate::BLOCK_SIZE * 2, now + Duration::from_secs(1));
        assert_eq!(evicted, vec![0]);
        assert!(!mgr.contains(0));
        assert!(mgr.contains(1));
    }

    #[test]
    fn timeouts_free_stale_requests() {
        let now = Instant::now();
        let mut piece = ActivePiece::new(0, crate::BLOCK_SIZE, now);
        let peer = addr(1);
        let b0 = BlockRequest { piece_idx: 0, offset: 0, len: crate::BLOCK_SIZE };
        piece.add_request(b0, peer, now);
        let freed = piece.check_timeouts(Duration::from_secs(60), now + Duration::from_secs(120));
        assert_eq!(freed, vec![b0]);
    }
}
