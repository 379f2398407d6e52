//! undertow
//!
//! A BitTorrent download engine: per-peer wire-protocol state machines and a
//! per-torrent transfer supervisor that dials tracker-announced peers,
//! verifies every piece against its digest and writes it into a
//! pre-allocated file set.

pub mod bitfield;
pub mod cli;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod transfer;

/// 20-byte SHA-1 of the bencoded info dictionary; identifies a torrent
pub type InfoHash = [u8; 20];

/// 20-byte identifier chosen by each client instance
pub type PeerId = [u8; 20];

pub use bitfield::Bitfield;
pub use config::Config;
pub use error::Error;
pub use peer::PeerConnection;
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{Block, FileMap, Piece, BLOCK_SIZE};
pub use torrent::Metainfo;
pub use tracker::Tracker;
pub use transfer::{accept_peers, Transfer};
