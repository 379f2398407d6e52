//! .torrent file parsing.
//!
//! The raw bencode structures mirror the metainfo dictionary; `Metainfo` is
//! the engine-facing descriptor with the piece digest table split out. The
//! info hash is the SHA-1 of the re-serialized info dictionary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::Error;
use crate::InfoHash;

const SHA1_LEN: usize = 20;

/// One file of a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components below the torrent root directory
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Parsed torrent descriptor
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker announce URL (empty if the torrent carries none)
    pub announce: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: InfoHash,
    /// Piece size in bytes (the last piece may be shorter)
    pub piece_length: u32,
    /// Per-piece SHA-1 digests
    pub pieces: Vec<[u8; 20]>,
    /// Display name; also the file or root directory name on disk
    pub name: String,
    /// Single-file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Multi-file listing (None for single-file torrents)
    pub files: Option<Vec<FileEntry>>,
}

// Field order matches bencode key order so re-serializing the info dict
// reproduces the original bytes for hashing.
#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    pieces: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTorrent {
    #[serde(default)]
    announce: String,
    info: RawInfo,
}

impl Metainfo {
    /// Parse a .torrent from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let raw: RawTorrent = de::from_bytes(data)
            .map_err(|e| Error::parse_with_source("failed to parse torrent file", e.to_string()))?;

        let info_hash = raw.info.hash()?;
        let pieces = split_piece_hashes(&raw.info.pieces)?;

        let files = raw.info.files.map(|fs| {
            fs.into_iter()
                .map(|f| FileEntry {
                    path: f.path,
                    length: f.length,
                })
                .collect::<Vec<_>>()
        });

        if raw.info.length.is_none() && files.is_none() {
            return Err(Error::parse("torrent has neither length nor files"));
        }
        if raw.info.piece_length == 0 {
            return Err(Error::parse("piece length is zero"));
        }

        let meta = Self {
            announce: raw.announce,
            info_hash,
            piece_length: raw.info.piece_length,
            pieces,
            name: raw.info.name,
            length: raw.info.length,
            files,
        };

        let expected = (meta.total_size() + meta.piece_length as u64 - 1) / meta.piece_length as u64;
        if expected != meta.pieces.len() as u64 {
            return Err(Error::parse_with_source(
                "piece count does not match total size",
                format!("{} digests for {} pieces", meta.pieces.len(), expected),
            ));
        }

        debug!(
            "parsed torrent {:?}: {} pieces of {} bytes, info hash {}",
            meta.name,
            meta.piece_count(),
            meta.piece_length,
            meta.info_hash_hex()
        );
        Ok(meta)
    }

    /// Load and parse a .torrent file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path).map_err(|e| {
            Error::storage_full(
                "failed to read torrent file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        Self::from_bytes(&data)
    }

    /// Total content size across all files
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte length of piece `index`; only the last piece may be short
    pub fn piece_length_at(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = std::cmp::min(start + self.piece_length as u64, self.total_size());
        (end - start) as u32
    }

    /// Global byte offset of piece `index`
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// True when the torrent describes a directory of files
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl RawInfo {
    /// SHA-1 over the bencoded info dictionary
    fn hash(&self) -> Result<InfoHash, Error> {
        let buf = ser::to_bytes(self)
            .map_err(|e| Error::parse_with_source("failed to encode info dictionary", e.to_string()))?;
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        Ok(hasher.finalize().into())
    }
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>, Error> {
    if pieces.len() % SHA1_LEN != 0 {
        return Err(Error::parse_with_source(
            "pieces field is not a multiple of 20 bytes",
            pieces.len().to_string(),
        ));
    }
    Ok(pieces
        .chunks_exact(SHA1_LEN)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(name: &str, length: u64, piece_length: u32, digests: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce21:http://tracker.test/a4:infod");
        out.extend_from_slice(format!("6:lengthi{}e", length).as_bytes());
        out.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        out.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
        out.extend_from_slice(format!("6:pieces{}:", digests.len()).as_bytes());
        out.extend_from_slice(digests);
        out.extend_from_slice(b"ee");
        out
    }

    #[test]
    fn test_parse_single_file() {
        let digests = [7u8; 40];
        let data = bencode_single_file("a.bin", 20000, 16384, &digests);
        let meta = Metainfo::from_bytes(&data).unwrap();

        assert_eq!(meta.announce, "http://tracker.test/a");
        assert_eq!(meta.name, "a.bin");
        assert_eq!(meta.piece_length, 16384);
        assert_eq!(meta.length, Some(20000));
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.pieces[0], [7u8; 20]);
        assert!(!meta.is_multi_file());
        assert_eq!(meta.total_size(), 20000);
    }

    #[test]
    fn test_info_hash_covers_info_dict_only() {
        let digests = [7u8; 40];
        let data = bencode_single_file("a.bin", 20000, 16384, &digests);
        let meta = Metainfo::from_bytes(&data).unwrap();

        // Hash of the info dict exactly as it appears between "4:info" and
        // the trailing dictionary terminator.
        let start = data.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let info_bytes = &data[start..data.len() - 1];
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_parse_multi_file() {
        let digests = [1u8; 20];
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce21:http://tracker.test/a4:infod");
        data.extend_from_slice(b"5:filesl");
        data.extend_from_slice(b"d6:lengthi600e4:pathl5:a.txtee");
        data.extend_from_slice(b"d6:lengthi424e4:pathl3:sub5:b.txtee");
        data.extend_from_slice(b"e");
        data.extend_from_slice(b"4:name4:root");
        data.extend_from_slice(b"12:piece lengthi16384e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&digests);
        data.extend_from_slice(b"ee");

        let meta = Metainfo::from_bytes(&data).unwrap();
        assert!(meta.is_multi_file());
        assert_eq!(meta.total_size(), 1024);
        let files = meta.files.as_ref().unwrap();
        assert_eq!(files[0].path, vec!["a.txt"]);
        assert_eq!(files[1].path, vec!["sub", "b.txt"]);
        assert_eq!(files[1].length, 424);
    }

    #[test]
    fn test_piece_length_at_short_last_piece() {
        let digests = [7u8; 40];
        let data = bencode_single_file("a.bin", 20000, 16384, &digests);
        let meta = Metainfo::from_bytes(&data).unwrap();

        assert_eq!(meta.piece_length_at(0), 16384);
        assert_eq!(meta.piece_length_at(1), 20000 - 16384);
        assert_eq!(meta.piece_offset(1), 16384);
    }

    #[test]
    fn test_rejects_ragged_pieces_field() {
        let digests = [7u8; 21];
        let data = bencode_single_file("a.bin", 16384, 16384, &digests);
        assert!(Metainfo::from_bytes(&data).is_err());
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let digests = [7u8; 60]; // three digests for a two-piece torrent
        let data = bencode_single_file("a.bin", 20000, 16384, &digests);
        assert!(Metainfo::from_bytes(&data).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Metainfo::from_bytes(b"not a torrent").is_err());
    }
}
