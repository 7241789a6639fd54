//! Block addressing
//!
//! Converts between `(piece, offset, length)` triples and flat block indices.

use serde::{Deserialize, Serialize};

/// Default block size requested from peers (16 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// A unit of transfer within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    /// Piece index this block belongs to
    pub piece_index: u32,
    /// Offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl Block {
    /// Create a new block
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    /// Absolute byte address of the block's first byte
    pub fn absolute_address(&self, piece_length: u64) -> u64 {
        self.piece_index as u64 * piece_length + self.offset as u64
    }
}

/// Fixed layout of a torrent's pieces and blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub piece_length: u64,
    pub total_length: u64,
    pub piece_count: usize,
    pub block_size: u32,
}

impl BlockLayout {
    /// Number of blocks covering the whole torrent
    pub fn block_count(&self) -> usize {
        self.total_length.div_ceil(self.block_size as u64) as usize
    }

    /// Length of the piece at `index`; the last piece holds the remainder
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 == self.piece_count {
            self.total_length - self.piece_length * (self.piece_count as u64 - 1)
        } else {
            self.piece_length
        }
    }

    /// Block at flat index `index`, truncated at the end of the torrent
    pub fn block_at(&self, index: usize) -> Block {
        let address = index as u64 * self.block_size as u64;
        let piece_index = (address / self.piece_length) as u32;
        let offset = (address % self.piece_length) as u32;
        let length = (self.total_length - address).min(self.block_size as u64) as u32;
        Block::new(piece_index, offset, length)
    }

    /// Flat index of `block`, or `None` if it does not start on a block boundary
    /// inside the torrent
    pub fn index_of(&self, block: &Block) -> Option<usize> {
        if block.piece_index as usize >= self.piece_count
            || block.offset as u64 >= self.piece_size(block.piece_index as usize)
        {
            return None;
        }
        let address = block.absolute_address(self.piece_length);
        if address % self.block_size as u64 != 0 {
            return None;
        }
        Some((address / self.block_size as u64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> BlockLayout {
        BlockLayout {
            piece_length: 8,
            total_length: 20,
            piece_count: 3,
            block_size: 4,
        }
    }

    #[test]
    fn test_block_count_and_piece_sizes() {
        let layout = small_layout();
        assert_eq!(layout.block_count(), 5);
        assert_eq!(layout.piece_size(0), 8);
        assert_eq!(layout.piece_size(1), 8);
        assert_eq!(layout.piece_size(2), 4);
    }

    #[test]
    fn test_block_at() {
        let layout = small_layout();
        assert_eq!(layout.block_at(0), Block::new(0, 0, 4));
        assert_eq!(layout.block_at(1), Block::new(0, 4, 4));
        assert_eq!(layout.block_at(3), Block::new(1, 4, 4));
        assert_eq!(layout.block_at(4), Block::new(2, 0, 4));
    }

    #[test]
    fn test_last_block_truncated() {
        let layout = BlockLayout {
            piece_length: 8,
            total_length: 18,
            piece_count: 3,
            block_size: 4,
        };
        assert_eq!(layout.block_count(), 5);
        assert_eq!(layout.block_at(4), Block::new(2, 0, 2));
    }

    #[test]
    fn test_index_of() {
        let layout = small_layout();
        for index in 0..layout.block_count() {
            assert_eq!(layout.index_of(&layout.block_at(index)), Some(index));
        }
        assert_eq!(layout.index_of(&Block::new(3, 0, 4)), None);
        assert_eq!(layout.index_of(&Block::new(2, 4, 4)), None);
        assert_eq!(layout.index_of(&Block::new(0, 2, 4)), None);
    }
}
