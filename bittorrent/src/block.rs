use std::sync::Arc;

use crate::store::StoreInfo;
use crate::BLOCK_SIZE;

/// Payload of a `piece` wire message. `Cached` avoids copying when the
/// block came from the disk read cache; `Owned` is used for freshly-read or
/// freshly-received data.
#[derive(Debug, Clone)]
pub enum BlockPayload {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl BlockPayload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockPayload::Owned(v) => v,
            BlockPayload::Cached(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            BlockPayload::Owned(v) => v,
            BlockPayload::Cached(v) => (*v).clone(),
        }
    }
}

impl PartialEq for BlockPayload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}
impl Eq for BlockPayload {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    // Data of block.
    pub data: BlockPayload,
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {
    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,
}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    pub fn from_block(block: &BlockData) -> Self {
        BlockInfo {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        }
    }

    /// Rejects requests/cancels that reference a nonexistent piece or a
    /// range outside it or larger than a block, before we ever touch disk.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        if self.piece_idx >= info.num_pieces as usize {
            return false;
        }
        if self.len == 0 || self.len > BLOCK_SIZE {
            return false;
        }
        let piece_len = info.piece_length(self.piece_idx);
        self.offset < piece_len && self.offset + self.len <= piece_len
    }
}

/// A requested block is identified by the same triple as `BlockInfo`; kept
/// as a distinct name at call sites that track in-flight requests.
pub type BlockRequest = BlockInfo;

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        (0..12)
            .into_iter()
            .for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i as u32));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn cached_and_owned_compare_equal() {
        let owned = BlockPayload::Owned(vec![1, 2, 3]);
        let cached = BlockPayload::Cached(Arc::new(vec![1, 2, 3]));
        assert_eq!(owned, cached);
    }
}
