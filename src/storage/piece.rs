//! Piece and block model.
//!
//! A piece owns its ordered blocks, its digest, the received-block bitfield,
//! the inbound block channel and the list of peers known to have it. Blocks
//! are the 16 KiB request unit; only the final block of the final piece may
//! be short.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::bitfield::Bitfield;
use crate::peer::PeerConnection;
use crate::torrent::Metainfo;

/// Request/response unit of the peer protocol. All current implementations
/// use 16 KiB and drop peers that ask for more.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// A 16 KiB sub-slice of a piece (the last block may be short)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Index within the piece
    pub index: u32,
    /// Length in bytes
    pub length: u32,
}

impl Block {
    /// Byte offset of this block within its piece
    pub fn offset_in_piece(&self) -> u32 {
        self.index * BLOCK_SIZE
    }
}

/// A block received from a peer, routed from its read loop to the piece's
/// active downloader
pub struct PeerBlock {
    /// The connection that produced the block
    pub peer: Arc<PeerConnection>,
    /// Block index within the piece
    pub block_index: u32,
    /// Block payload
    pub data: Vec<u8>,
}

/// One hash-verified slice of the torrent content
#[derive(Debug)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Byte length (the last piece may be short)
    pub length: u32,
    /// Global byte offset of the piece within the content
    pub offset: u64,
    /// Expected SHA-1 of the piece bytes
    pub hash: [u8; 20],
    /// Ordered blocks covering the piece
    pub blocks: Vec<Block>,
    /// Sender cloned by peer read loops delivering PIECE payloads
    pub block_tx: mpsc::Sender<PeerBlock>,
    /// Receiver held by the single active downloader
    pub block_rx: tokio::sync::Mutex<mpsc::Receiver<PeerBlock>>,
    /// Peers known to advertise this piece
    pub peers: Mutex<Vec<Arc<PeerConnection>>>,
    received: Mutex<Bitfield>,
    downloaded: AtomicBool,
}

impl Piece {
    /// Create a piece with its block layout
    pub fn new(index: u32, length: u32, offset: u64, hash: [u8; 20]) -> Self {
        let blocks = split_blocks(length);
        let (block_tx, block_rx) = mpsc::channel(1);
        Self {
            index,
            length,
            offset,
            hash,
            received: Mutex::new(Bitfield::new(blocks.len() as u32)),
            blocks,
            block_tx,
            block_rx: tokio::sync::Mutex::new(block_rx),
            peers: Mutex::new(Vec::new()),
            downloaded: AtomicBool::new(false),
        }
    }

    /// Block at `block_index`, if the piece has one
    pub fn block(&self, block_index: u32) -> Option<&Block> {
        self.blocks.get(block_index as usize)
    }

    /// True once the piece has been received in full and hash-verified
    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Flip the downloaded flag; called only after digest verification
    pub(crate) fn mark_downloaded(&self) {
        self.downloaded.store(true, Ordering::SeqCst);
    }

    /// Record that a block arrived
    pub(crate) fn mark_block(&self, block_index: u32) {
        self.received.lock().unwrap().set(block_index);
    }

    /// Number of blocks received during the current attempt history
    pub fn received_blocks(&self) -> u32 {
        self.received.lock().unwrap().count()
    }

    /// Remember that `peer` advertises this piece
    pub fn add_peer(&self, peer: Arc<PeerConnection>) {
        self.peers.lock().unwrap().push(peer);
    }

    /// Compare `data` against the stored digest
    pub fn verify(&self, data: &[u8]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.hash
    }
}

/// Build the piece table for a torrent
pub fn build_pieces(meta: &Metainfo) -> Vec<Arc<Piece>> {
    meta.pieces
        .iter()
        .enumerate()
        .map(|(i, hash)| {
            let index = i as u32;
            Arc::new(Piece::new(
                index,
                meta.piece_length_at(index),
                meta.piece_offset(index),
                *hash,
            ))
        })
        .collect()
}

fn split_blocks(piece_length: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(((piece_length + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize);
    let mut remaining = piece_length;
    let mut index = 0;
    while remaining > 0 {
        let length = remaining.min(BLOCK_SIZE);
        blocks.push(Block { index, length });
        remaining -= length;
        index += 1;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout_exact_multiple() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, 0, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.blocks[0].length, BLOCK_SIZE);
        assert_eq!(piece.blocks[1].length, BLOCK_SIZE);
        assert_eq!(piece.blocks[1].offset_in_piece(), BLOCK_SIZE);
    }

    #[test]
    fn test_block_layout_short_tail() {
        let piece = Piece::new(3, BLOCK_SIZE + 100, 3 * 32768, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.blocks[0].length, BLOCK_SIZE);
        assert_eq!(piece.blocks[1].length, 100);
    }

    #[test]
    fn test_block_layout_single_short_piece() {
        let piece = Piece::new(0, 5000, 0, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 1);
        assert_eq!(piece.blocks[0].length, 5000);
    }

    #[test]
    fn test_block_lookup() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, 0, [0u8; 20]);
        assert_eq!(piece.block(1).unwrap().index, 1);
        assert!(piece.block(2).is_none());
    }

    #[test]
    fn test_downloaded_flag() {
        let piece = Piece::new(0, BLOCK_SIZE, 0, [0u8; 20]);
        assert!(!piece.is_downloaded());
        piece.mark_downloaded();
        assert!(piece.is_downloaded());
    }

    #[test]
    fn test_received_block_accounting() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, 0, [0u8; 20]);
        assert_eq!(piece.received_blocks(), 0);
        piece.mark_block(1);
        assert_eq!(piece.received_blocks(), 1);
    }

    #[test]
    fn test_verify_digest() {
        let data = vec![b'A'; 16384];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();

        let piece = Piece::new(0, 16384, 0, hash);
        assert!(piece.verify(&data));
        assert!(!piece.verify(&vec![b'B'; 16384]));
    }

    #[test]
    fn test_build_pieces_from_metainfo() {
        let meta = Metainfo {
            announce: String::new(),
            info_hash: [0u8; 20],
            piece_length: 32768,
            pieces: vec![[1u8; 20], [2u8; 20]],
            name: "t".to_string(),
            length: Some(32768 + 5000),
            files: None,
        };
        let pieces = build_pieces(&meta);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].length, 32768);
        assert_eq!(pieces[0].blocks.len(), 2);
        assert_eq!(pieces[1].length, 5000);
        assert_eq!(pieces[1].offset, 32768);
        assert_eq!(pieces[1].hash, [2u8; 20]);
    }
}
