//! Torrent descriptor handling: .torrent parsing and metadata access.

pub mod metainfo;

pub use metainfo::{FileEntry, Metainfo};
