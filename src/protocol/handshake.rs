//! BitTorrent handshake.
//!
//! The 68-byte exchange that opens every peer connection: protocol string,
//! reserved bytes, info-hash and peer id.

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::error::Error;
use crate::{InfoHash, PeerId};

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix baked into generated peer ids (Azureus style)
const PEER_ID_PREFIX: &[u8; 8] = b"-UW0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Torrent info hash
    pub info_hash: InfoHash,
    /// Sender's peer id
    pub peer_id: PeerId,
}

impl Handshake {
    /// Create a new handshake for `info_hash` signed with `peer_id`
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    /// Generate a fresh peer id with the client prefix
    pub fn generate_peer_id() -> PeerId {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        peer_id
    }

    /// Serialize the handshake to its 68-byte wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]); // reserved
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from its 68-byte wire form
    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HANDSHAKE_LEN {
            return Err(Error::protocol_with_source(
                "handshake too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            ));
        }
        if data[0] != PROTOCOL_LENGTH {
            return Err(Error::protocol_with_source(
                "invalid protocol string length",
                format!("{}", data[0]),
            ));
        }
        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::protocol("invalid protocol string"));
        }
        // data[20..28] are the reserved bytes; extensions are not negotiated.
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Check that the remote echoed the info hash we serve
    pub fn validate(&self, expected_info_hash: &InfoHash) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}
