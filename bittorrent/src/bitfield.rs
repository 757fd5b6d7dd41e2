use crate::Bitfield;

/// Extension methods for the wire-format bitfield (`BitVec<u8, Msb0>`).
///
/// Kept as a trait over the existing `Bitfield` alias rather than a newtype
/// so the rest of the crate (message codec, picker, swarm) can keep treating
/// bitfields as plain `BitVec`s on the wire while gaining `hex`/`from_hex`
/// round-tripping and a couple of small helpers used by persistence and
/// the `.parts` advertised-bitfield computation.
pub trait BitfieldExt {
    fn new_zeroed(num_pieces: usize) -> Bitfield;
    fn to_hex(&self) -> String;
    fn from_hex(s: &str, num_pieces: usize) -> Option<Bitfield>;
    /// `self AND NOT other`, used for the advertised-bitfield invariant.
    fn and_not(&self, other: &Bitfield) -> Bitfield;
}

impl BitfieldExt for Bitfield {
    fn new_zeroed(num_pieces: usize) -> Bitfield {
        Bitfield::repeat(false, num_pieces)
    }

    fn to_hex(&self) -> String {
        hex::encode(self.as_raw_slice())
    }

    fn from_hex(s: &str, num_pieces: usize) -> Option<Bitfield> {
        let bytes = hex::decode(s).ok()?;
        let mut bf = Bitfield::from_vec(bytes);
        bf.resize(num_pieces, false);
        Some(bf)
    }

    fn and_not(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.len(), other.len());
        let mut out = self.clone();
        out &= !other.clone();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn hex_round_trip() {
        let mut bf: Bitfield = BitVec::repeat(false, 20);
        bf.set(0, true);
        bf.set(5, true);
        bf.set(19, true);
        let hex = bf.to_hex();
        let back = Bitfield::from_hex(&hex, 20).unwrap();
        assert_eq!(bf, back);
    }

    #[test]
    fn and_not_excludes_parts_pieces() {
        let mut have: Bitfield = BitVec::repeat(false, 4);
        have.set(0, true);
        have.set(1, true);
        let mut parts: Bitfield = BitVec::repeat(false, 4);
        parts.set(1, true);
        let advertised = have.and_not(&parts);
        assert!(advertised[0]);
        assert!(!advertised[1]);
    }
}
