//! Length-prefixed frame I/O over async streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::Error;

/// Read one frame: the 4-byte length prefix, then the payload.
///
/// An empty payload is a keep-alive. A prefix larger than `max_len` is a
/// protocol violation, so a hostile peer cannot make us allocate its choice
/// of buffer.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::peer_with_source("failed to read frame header", e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(Error::protocol_with_source(
            "frame exceeds maximum length",
            format!("{} > {}", len, max_len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::peer_with_source("failed to read frame payload", e.to_string()))?;
    Ok(payload)
}

/// Write a message as one frame and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&message.encode())
        .await
        .map_err(|e| Error::peer_with_source("failed to write message", e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::peer_with_source("failed to flush message", e.to_string()))?;
    Ok(())
}

/// Read the 68-byte handshake from the stream
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::peer_with_source("failed to read handshake", e.to_string()))?;
    Handshake::deserialize(&buf)
}

/// Write the 68-byte handshake to the stream
pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&handshake.serialize())
        .await
        .map_err(|e| Error::peer_with_source("failed to write handshake", e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::peer_with_source("failed to flush handshake", e.to_string()))?;
    Ok(())
}
