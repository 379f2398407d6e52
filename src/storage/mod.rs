//! On-disk storage: piece/block model and the pre-allocated file set.

pub mod allocator;
pub mod piece;

pub use allocator::FileMap;
pub use piece::{build_pieces, Block, PeerBlock, Piece, BLOCK_SIZE};
