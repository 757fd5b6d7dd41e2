use std::net::SocketAddr;

use crate::block::BlockRequest;
use crate::picker::active_piece::ActivePieceManager;

/// Default cap on how many peers may be asked for the same block at once
/// once a torrent enters endgame.
pub const DEFAULT_MAX_DUPLICATE_REQUESTS: usize = 3;

/// Decides whether the swarm has entered endgame (all pieces started, none
/// complete-and-idle) and, if so, which duplicate requests to issue and
/// which in-flight requests to cancel once a block lands from elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct EndgameManager {
    max_duplicate_requests: usize,
}

impl Default for EndgameManager {
    fn default() -> Self {
        Self {
            max_duplicate_requests: DEFAULT_MAX_DUPLICATE_REQUESTS,
        }
    }
}

impl EndgameManager {
    pub fn new(max_duplicate_requests: usize) -> Self {
        Self { max_duplicate_requests }
    }

    /// True once there are no more never-requested pieces left to start,
    /// i.e. every remaining piece is already active.
    pub fn is_endgame(&self, remaining_unstarted_pieces: usize) -> bool {
        remaining_unstarted_pieces == 0
    }

    pub fn should_send_duplicate_request(&self, current_requesters: usize) -> bool {
        current_requesters < self.max_duplicate_requests
    }

    /// Duplicate block requests to hand to `peer`, drawn from any active
    /// piece the peer has, up to `max` total.
    pub fn evaluate(
        &self,
        active: &ActivePieceManager,
        peer: SocketAddr,
        peer_has: impl Fn(usize) -> bool,
        max: usize,
    ) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        for &idx in active.active_indices().collect::<Vec<_>>() {
            if out.len() >= max {
                break;
            }
            if !peer_has(idx) {
                continue;
            }
            if let Some(piece) = active.get(idx) {
                let remaining = max - out.len();
                out.extend(piece.needed_blocks_endgame(remaining, self.max_duplicate_requests, peer));
            }
        }
        out
    }

    /// When a block is received during endgame, every other peer that was
    /// also asked for it should be sent CANCEL for the redundant request.
    pub fn cancels_for_received_block(
        &self,
        active: &ActivePieceManager,
        piece_idx: usize,
        idx_in_piece: usize,
        received_from: SocketAddr,
    ) -> Vec<SocketAddr> {
        active
            .get(piece_idx)
            .map(|p| p.other_requesters(idx_in_piece, received_from))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::active_piece::ActivePieceManager;
    use std::time::Instant;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn endgame_triggers_when_all_pieces_started() {
        let mgr = EndgameManager::default();
        assert!(mgr.is_endgame(0));
        assert!(!mgr.is_endgame(3));
    }

    #[test]
    fn respects_max_duplicate_requests() {
        let mgr = EndgameManager::new(2);
        assert!(mgr.should_send_duplicate_request(0));
        assert!(mgr.should_send_duplicate_request(1));
        assert!(!mgr.should_send_duplicate_request(2));
    }

    #[test]
    fn cancels_go_to_other_requesters_only() {
        let now = Instant::now();
        let mut active = ActivePieceManager::new(1024 * 1024);
        active.start(0, crate::BLOCK_SIZE, now);
        let p1 = addr(1);
        let p2 = addr(2);
        let block = crate::block::BlockInfo { piece_idx: 0, offset: 0, len: crate::BLOCK_SIZE };
        active.get_mut(0).unwrap().add_request(block, p1, now);
        active.get_mut(0).unwrap().add_request(block, p2, now);

        let mgr = EndgameManager::default();
        let cancels = mgr.cancels_for_received_block(&active, 0, 0, p1);
        assert_eq!(cancels, vec![p2]);
    }
}
