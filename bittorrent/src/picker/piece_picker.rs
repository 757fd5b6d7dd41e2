use std::collections::HashSet;
use crate::Bitfield;

/// Pure piece-selection function.
///
/// Filter: `peerBitfield[i] AND NOT ownBitfield[i] AND priority[i] > 0`.
/// Order (stable): higher priority first, then started pieces first, then
/// lower availability (rarer) first. Ties are broken by piece index, which
/// keeps the function deterministic for identical inputs (mandated by the
/// "PiecePicker purity" design note).
pub fn select_pieces(
    peer_bitfield: &Bitfield,
    own_bitfield: &Bitfield,
    priority: &[u8],
    availability: &[u16],
    started: &HashSet<usize>,
    max_pieces: usize,
) -> Vec<usize> {
    debug_assert_eq!(peer_bitfield.len(), own_bitfield.len());

    let mut candidates: Vec<usize> = (0..own_bitfield.len())
        .filter(|&i| peer_bitfield[i] && !own_bitfield[i] && priority.get(i).copied().unwrap_or(1) > 0)
        .collect();

    candidates.sort_by(|&a, &b| {
        let pri_a = priority.get(a).copied().unwrap_or(1);
        let pri_b = priority.get(b).copied().unwrap_or(1);
        pri_b
            .cmp(&pri_a)
            .then_with(|| started.contains(&b).cmp(&started.contains(&a)))
            .then_with(|| availability.get(a).copied().unwrap_or(0).cmp(&availability.get(b).copied().unwrap_or(0)))
            .then_with(|| a.cmp(&b))
    });

    candidates.truncate(max_pieces);
    candidates
}

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    frequency: u16,
}

/// Stateful snapshot holder around `select_pieces`: tracks per-piece
/// availability (incremented by BITFIELD/HAVE) and our own bitfield, and
/// per-piece priority (0 = blacklisted, 1 = normal, 2 = high).
#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceInfo>,
    priority: Vec<u8>,
    have: Bitfield,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            priority: vec![1; num_pieces],
            have,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn availability(&self) -> Vec<u16> {
        self.pieces.iter().map(|p| p.frequency).collect()
    }

    pub fn priority(&self) -> &[u8] {
        &self.priority
    }

    pub fn set_priority(&mut self, idx: usize, priority: u8) {
        self.priority[idx] = priority;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        !self.have[idx]
    }

    pub fn decrement_piece(&mut self, idx: usize) {
        if let Some(p) = self.pieces.get_mut(idx) {
            p.frequency = p.frequency.saturating_sub(1);
        }
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
    }

    /// Returns true if the peer has at least one piece we want.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        for (i, has) in bf.iter().enumerate() {
            if *has {
                self.pieces[i].frequency += 1;
                if !self.have[i] && self.priority[i] > 0 {
                    interested = true;
                }
            }
        }
        interested
    }

    /// Selects the single next piece to start, given the peer's bitfield
    /// and the set of already-started (active) piece indices.
    pub fn pick_piece(&self, peer_bf: &Bitfield, started: &HashSet<usize>) -> Option<usize> {
        let availability = self.availability();
        select_pieces(peer_bf, &self.have, &self.priority, &availability, started, 1)
            .into_iter()
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    // S1: four pieces, availability [3,2,2,1] (piece 3 rarest), all owned
    // by peer C who has all pieces. Expect order [3,2,1,0].
    #[test]
    fn rarest_first_correctness() {
        let own: Bitfield = BitVec::repeat(false, 4);
        let peer_c: Bitfield = BitVec::repeat(true, 4);
        let priority = vec![1u8; 4];
        let availability = vec![3u16, 2, 2, 1];
        let started = HashSet::new();

        let order = select_pieces(&peer_c, &own, &priority, &availability, &started, 4);
        assert_eq!(order, vec![3, 1, 2, 0]);
    }

    #[test]
    fn priority_trumps_rarity() {
        let own: Bitfield = BitVec::repeat(false, 3);
        let peer: Bitfield = BitVec::repeat(true, 3);
        let priority = vec![1u8, 2, 1];
        let availability = vec![1u16, 5, 1];
        let started = HashSet::new();
        let order = select_pieces(&peer, &own, &priority, &availability, &started, 3);
        // Piece 1 has higher priority despite being the most available.
        assert_eq!(order[0], 1);
    }

    #[test]
    fn started_pieces_preferred_over_rarer_unstarted() {
        let own: Bitfield = BitVec::repeat(false, 3);
        let peer: Bitfield = BitVec::repeat(true, 3);
        let priority = vec![1u8; 3];
        let availability = vec![5u16, 1, 5];
        let mut started = HashSet::new();
        started.insert(0);
        let order = select_pieces(&peer, &own, &priority, &availability, &started, 3);
        assert_eq!(order[0], 0);
    }

    #[test]
    fn blacklisted_pieces_excluded() {
        let own: Bitfield = BitVec::repeat(false, 2);
        let peer: Bitfield = BitVec::repeat(true, 2);
        let priority = vec![0u8, 1];
        let availability = vec![1u16, 1];
        let started = HashSet::new();
        let order = select_pieces(&peer, &own, &priority, &availability, &started, 2);
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let own: Bitfield = BitVec::repeat(false, 8);
        let peer: Bitfield = BitVec::repeat(true, 8);
        let priority = vec![1u8; 8];
        let availability = vec![2u16, 1, 2, 1, 3, 1, 2, 1];
        let started = HashSet::new();
        let a = select_pieces(&peer, &own, &priority, &availability, &started, 8);
        let b = select_pieces(&peer, &own, &priority, &availability, &started, 8);
        assert_eq!(a, b);
    }
}
