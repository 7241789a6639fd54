//! Block selector
//!
//! Authoritative record of which blocks are still outstanding. Picks the next
//! block to request uniformly at random among the missing ones and reconciles
//! arriving blocks against the per-piece byte counters.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing::{debug, info, trace};

use crate::error::TorrentError;
use crate::events::{EventBus, TransferEvent};
use crate::strategy::address_set::BlockAddressSet;
use crate::strategy::bitfield::Bitfield;
use crate::strategy::block::{Block, BlockLayout};
use crate::torrent::TorrentInfo;

/// Default number of random draws before giving up on the peer's bitfield
pub const DEFAULT_SELECTION_ATTEMPTS: u32 = 10;

#[derive(Debug)]
struct SelectorState {
    unavailable: BlockAddressSet,
    remaining: Vec<i64>,
    bitfield: Bitfield,
    available: usize,
}

/// Thread-safe block selection strategy for one transfer
#[derive(Debug)]
pub struct BlockSelector {
    layout: BlockLayout,
    block_count: usize,
    max_attempts: u32,
    state: Mutex<SelectorState>,
    events: Option<EventBus>,
}

impl BlockSelector {
    /// Create a selector for the given layout
    pub fn new(layout: BlockLayout, max_attempts: u32) -> Result<Self> {
        Self::validate_layout(&layout)?;

        let block_count = layout.block_count();
        let remaining = (0..layout.piece_count)
            .map(|index| layout.piece_size(index) as i64)
            .collect();

        info!(
            "Block selector ready: {} pieces, {} blocks of {} bytes, {} bytes total",
            layout.piece_count, block_count, layout.block_size, layout.total_length
        );

        Ok(Self {
            layout,
            block_count,
            max_attempts: max_attempts.max(1),
            state: Mutex::new(SelectorState {
                unavailable: BlockAddressSet::with_range(block_count),
                remaining,
                bitfield: Bitfield::new(layout.piece_count),
                available: 0,
            }),
            events: None,
        })
    }

    /// Create a selector from torrent metadata
    pub fn for_torrent(info: &TorrentInfo, block_size: u32, max_attempts: u32) -> Result<Self> {
        Self::new(
            BlockLayout {
                piece_length: info.piece_length,
                total_length: info.total_size(),
                piece_count: info.piece_count(),
                block_size,
            },
            max_attempts,
        )
    }

    /// Publish piece completions on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn validate_layout(layout: &BlockLayout) -> Result<()> {
        if layout.piece_length == 0 {
            return Err(TorrentError::invalid_metadata_with_field("piece length must be positive", "piece_length").into());
        }
        if layout.total_length == 0 {
            return Err(TorrentError::invalid_metadata_with_field("total length must be positive", "total_length").into());
        }
        if layout.piece_count == 0 {
            return Err(TorrentError::invalid_metadata_with_field("piece count must be positive", "piece_count").into());
        }
        if layout.block_size == 0 {
            return Err(TorrentError::invalid_metadata_with_field("block size must be positive", "block_size").into());
        }

        // Piece indices and offsets travel as u32 on the wire
        if layout.piece_length > u32::MAX as u64 {
            return Err(TorrentError::invalid_metadata_with_field(
                format!("piece length {} does not fit a 32-bit offset", layout.piece_length),
                "piece_length",
            )
            .into());
        }
        if layout.piece_count as u64 > u32::MAX as u64 + 1 {
            return Err(TorrentError::invalid_metadata_with_field(
                format!("{} pieces exceed the 32-bit piece index", layout.piece_count),
                "piece_count",
            )
            .into());
        }

        let expected_pieces = layout.total_length.div_ceil(layout.piece_length);
        if expected_pieces != layout.piece_count as u64 {
            return Err(TorrentError::invalid_metadata_with_field(
                format!(
                    "{} bytes in pieces of {} need {} pieces, metadata lists {}",
                    layout.total_length, layout.piece_length, expected_pieces, layout.piece_count
                ),
                "piece_count",
            )
            .into());
        }

        if layout.piece_length % layout.block_size as u64 != 0 {
            return Err(TorrentError::invalid_metadata_with_field(
                format!(
                    "piece length {} is not a multiple of block size {}",
                    layout.piece_length, layout.block_size
                ),
                "block_size",
            )
            .into());
        }

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick a block to request from a peer advertising `peer_bitfield`.
    ///
    /// Draws random missing blocks until one lies in a piece the peer has. If
    /// the attempts run out, the last drawn block is returned anyway and the
    /// peer may reject it. Returns `None` once nothing is missing.
    pub fn next(&self, peer_bitfield: &Bitfield) -> Option<Block> {
        let state = self.lock();
        if state.available == self.block_count {
            return None;
        }

        let mut rng = rand::thread_rng();
        let mut candidate = None;
        for _ in 0..self.max_attempts {
            let index = state.unavailable.random(&mut rng)?;
            let block = self.layout.block_at(index);
            if peer_bitfield.has(block.piece_index as usize) {
                trace!("Selected block {} (piece {}, offset {})", index, block.piece_index, block.offset);
                return Some(block);
            }
            candidate = Some(block);
        }

        if let Some(block) = candidate {
            debug!(
                "No block matched the peer bitfield after {} attempts, falling back to piece {} offset {}",
                self.max_attempts, block.piece_index, block.offset
            );
        }
        candidate
    }

    /// Record an arriving block. Returns false for duplicates, blocks that do
    /// not map onto the layout and empty blocks, leaving state untouched.
    pub fn received(&self, block: &Block) -> bool {
        let Some(address) = self.layout.index_of(block) else {
            debug!("Unneeded block incoming: piece {} offset {} is outside the layout", block.piece_index, block.offset);
            return false;
        };

        let mut state = self.lock();
        if block.length == 0 || !state.unavailable.contains(address) {
            debug!("Unneeded block incoming: {}", address);
            return false;
        }

        trace!("Needed block incoming: {}", address);
        state.unavailable.remove(address);
        state.available += 1;

        let piece = block.piece_index as usize;
        state.remaining[piece] -= block.length as i64;
        if state.remaining[piece] <= 0 && !state.bitfield.has(piece) {
            state.bitfield.set(piece);
            info!("Piece {} complete ({}/{} pieces)", piece, state.bitfield.count(), self.layout.piece_count);
            if let Some(events) = &self.events {
                events.publish(TransferEvent::PieceComplete(block.piece_index));
            }
        }
        true
    }

    /// Whether every block has been received
    pub fn is_complete(&self) -> bool {
        self.lock().unavailable.is_empty()
    }

    /// Snapshot of the completed-pieces bitfield
    pub fn bitfield(&self) -> Bitfield {
        self.lock().bitfield.clone()
    }

    /// Number of blocks received so far
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Bytes still missing from `piece`
    pub fn remaining(&self, piece: usize) -> Option<i64> {
        self.lock().remaining.get(piece).copied()
    }

    /// Bytes still missing from the whole torrent
    pub fn bytes_left(&self) -> u64 {
        self.lock().remaining.iter().map(|&r| r.max(0) as u64).sum()
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }
}
