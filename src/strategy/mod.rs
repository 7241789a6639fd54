//! Block selection module
//!
//! Decides which block to fetch next and tracks piece completion.

pub mod address_set;
pub mod bitfield;
pub mod block;
pub mod selector;

// Re-export main types
pub use address_set::BlockAddressSet;
pub use bitfield::Bitfield;
pub use block::{Block, BlockLayout, DEFAULT_BLOCK_SIZE};
pub use selector::{BlockSelector, DEFAULT_SELECTION_ATTEMPTS};
