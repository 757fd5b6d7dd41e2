use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::block::BlockRequest;
use crate::endgame::EndgameManager;
use crate::Bitfield;

pub mod active_piece;
pub mod piece_picker;

use active_piece::ActivePieceManager;
use piece_picker::PiecePicker;

/// Drives piece/block selection for a torrent: owns the rarest-first
/// ordering (`PiecePicker`) and the set of in-flight pieces
/// (`ActivePieceManager`), falling through to `EndgameManager` once every
/// piece has been started.
#[derive(Debug)]
pub struct Picker {
    pub piece_picker: RwLock<PiecePicker>,
    pub active: RwLock<ActivePieceManager>,
    endgame: EndgameManager,
    num_pieces: u32,
    piece_len: usize,
    last_piece_len: usize,
}

impl Picker {
    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Self {
        Self::with_budget(num_pieces, piece_len, last_piece_len, active_piece::DEFAULT_MAX_BUFFERED_BYTES)
    }

    pub fn with_budget(num_pieces: u32, piece_len: usize, last_piece_len: usize, max_buffered_bytes: usize) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            active: RwLock::new(ActivePieceManager::new(max_buffered_bytes)),
            endgame: EndgameManager::default(),
            num_pieces,
            piece_len,
            last_piece_len,
        }
    }

    fn piece_len_for(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Picks up to `target_queue_len - current_requests.len()` new block
    /// requests to send to `peer`, preferring already-started pieces, then
    /// starting new pieces via rarest-first, then falling back to endgame
    /// duplicate requests once nothing new remains.
    pub async fn pick_blocks(
        &self,
        peer: SocketAddr,
        current_requests: &HashSet<BlockRequest>,
        target_queue_len: usize,
        bf: &Bitfield,
        now: Instant,
    ) -> Vec<BlockRequest> {
        let mut requests = Vec::new();
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return requests;
        }

        // Prefer blocks from pieces already in flight that this peer has.
        {
            let mut active = self.active.write().await;
            let indices: Vec<usize> = active.active_indices().copied().collect();
            for idx in indices {
                if remaining == 0 {
                    break;
                }
                if !bf.get(idx).map(|b| *b).unwrap_or(false) {
                    continue;
                }
                if let Some(piece) = active.get_mut(idx) {
                    let needed = piece.needed_blocks(remaining);
                    for block in needed {
                        piece.add_request(block, peer, now);
                        requests.push(block);
                    }
                    remaining = target_queue_len.saturating_sub(current_requests.len() + requests.len());
                }
            }
        }

        // Start new pieces, rarest-first, until the queue is full or no
        // more pieces can be started.
        loop {
            if remaining == 0 {
                return requests;
            }
            let started: HashSet<usize> = self.active.read().await.active_indices().copied().collect();
            let idx = self.piece_picker.read().await.pick_piece(bf, &started);
            let Some(idx) = idx else { break };

            let piece_len = self.piece_len_for(idx);
            let mut active = self.active.write().await;
            active.start(idx, piece_len, now);
            let piece = active.get_mut(idx).expect("just started");
            let needed = piece.needed_blocks(remaining);
            for block in needed {
                piece.add_request(block, peer, now);
                requests.push(block);
            }
            drop(active);
            remaining = target_queue_len.saturating_sub(current_requests.len() + requests.len());
        }

        // Endgame: every piece has been started, so ask for duplicates of
        // blocks that are still outstanding.
        if remaining > 0 {
            let active = self.active.read().await;
            let endgame_picks = self.endgame.evaluate(
                &active,
                peer,
                |idx| bf.get(idx).map(|b| *b).unwrap_or(false),
                remaining,
            );
            drop(active);
            let mut active = self.active.write().await;
            for block in &endgame_picks {
                if let Some(piece) = active.get_mut(block.piece_idx) {
                    piece.add_request(*block, peer, now);
                }
            }
            requests.extend(endgame_picks);
        }

        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[tokio::test]
    async fn test_pick_blocks() {
        let picker = Picker::new(1028, 32_768, 32_768);
        let bf = BitVec::repeat(true, 1028);
        picker.piece_picker.write().await.bitfield_update(&bf);
        let now = Instant::now();
        let requests_1 = picker.pick_blocks(addr(), &HashSet::new(), 4, &bf, now).await;
        assert_eq!(requests_1.len(), 4);
        let requests_2 = picker.pick_blocks(addr(), &HashSet::new(), 4, &bf, now).await;
        assert_eq!(requests_2.len(), 4);
    }

    #[tokio::test]
    async fn test_pick_blocks_end_game() {
        let picker = Picker::new(2, 32_768, 32_768);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);
        let now = Instant::now();

        // Pick all the blocks (2 pieces * 2 blocks each).
        let requests_1 = picker.pick_blocks(addr(), &HashSet::new(), 4, &bf, now).await;
        assert_eq!(requests_1.len(), 4);

        // Nothing free remains, so this should fall into endgame duplicates.
        let requests_2 = picker.pick_blocks(addr(), &HashSet::new(), 4, &bf, now).await;
        assert_eq!(requests_2.len(), 4);
    }
}
