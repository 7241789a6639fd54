//! Piece bitfield
//!
//! One bit per piece, numbered from the high bit of the first byte, which is
//! also the layout of the wire `bitfield` message payload.

/// A bit-per-piece record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Create an empty bitfield for `piece_count` pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Create a bitfield with every piece set
    pub fn full(piece_count: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Create a bitfield from a wire payload, padding or truncating to `piece_count`
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);
        let mut bitfield = Self { bits, piece_count };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Whether the piece at `index` is set; out-of-range indices are never set
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte = self.bits[index / 8];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    /// Set the piece at `index`; out-of-range indices are ignored
    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - (index % 8));
    }

    /// Number of pieces tracked
    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.piece_count == 0
    }

    /// Number of set pieces
    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Whether every piece is set
    pub fn all(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Raw payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFF << spare;
            }
        }
    }
}
