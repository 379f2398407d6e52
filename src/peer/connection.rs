//! Post-handshake peer connection.
//!
//! Each connection is owned by the task running its message loop. The loop
//! writes our bitfield, then interprets incoming frames: choke state flips,
//! HAVE/BITFIELD fan out to the transfer, PIECE payloads are routed to the
//! piece's active downloader. Any framing error, invalid index or offset, or
//! an out-of-order BITFIELD drops the connection; errors never cross to the
//! transfer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::error::Error;
use crate::protocol::{wire, Message, MessageId};
use crate::storage::{PeerBlock, Piece, BLOCK_SIZE};
use crate::transfer::Transfer;

/// Choke/interest state guarded by one mutex so the unchoke signal moves
/// atomically with the flag.
#[derive(Debug)]
struct ChokeState {
    peer_choking: bool,
    interested_sent: bool,
    unchoked_tx: watch::Sender<bool>,
}

/// A connection to a remote peer after a completed handshake
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    state: Mutex<ChokeState>,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    peer_interested: AtomicBool,
    disconnected: AtomicBool,
    shutdown: Notify,
    read_timeout: std::time::Duration,
    unchoke_timeout: std::time::Duration,
    block_timeout: std::time::Duration,
}

impl PeerConnection {
    /// Wrap a handshaken stream; returns the connection and the read half
    /// for the message loop.
    pub fn new(stream: TcpStream, config: &Config) -> (Arc<Self>, OwnedReadHalf) {
        let addr = stream
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let (reader, writer) = stream.into_split();
        let (unchoked_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            addr,
            writer: Mutex::new(writer),
            state: Mutex::new(ChokeState {
                peer_choking: true,
                interested_sent: false,
                unchoked_tx,
            }),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_interested: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
            read_timeout: config.read_timeout,
            unchoke_timeout: config.unchoke_timeout,
            block_timeout: config.block_timeout,
        });
        (conn, reader)
    }

    /// Remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once the message loop has exited
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// We never unchoke remotes
    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::SeqCst)
    }

    /// True once INTERESTED has been sent
    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::SeqCst)
    }

    /// Remote's declared interest in us
    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::SeqCst)
    }

    /// Remote's choke state toward us
    pub async fn peer_choking(&self) -> bool {
        self.state.lock().await.peer_choking
    }

    /// Run the message loop until the peer disconnects or misbehaves.
    ///
    /// The transfer handle is a parameter, not a field: peers reach the
    /// transfer only while serving, and the transfer outlives its peers.
    pub async fn run(self: &Arc<Self>, reader: OwnedReadHalf, transfer: &Arc<Transfer>) {
        debug!("serving peer {}", self.addr);
        if let Err(e) = self.serve(reader, transfer).await {
            debug!("peer {} disconnected: {:#}", self.addr, e);
        }
        self.disconnected.store(true, Ordering::SeqCst);
        // References from piece peer lists may outlive the loop; shut the
        // socket down so the remote sees the disconnect.
        self.close().await;
    }

    async fn serve(
        self: &Arc<Self>,
        mut reader: OwnedReadHalf,
        transfer: &Arc<Transfer>,
    ) -> anyhow::Result<()> {
        let piece_count = transfer.piece_count() as u32;
        // Our local view of the remote's pieces.
        let mut remote_have = Bitfield::new(piece_count);
        // Big enough for a full bitfield or a block-carrying PIECE frame.
        let max_frame = (9 + BLOCK_SIZE as usize).max(1 + remote_have.as_bytes().len());

        self.send_bitfield(&transfer.bitfield_snapshot()).await?;

        let mut first = true;
        loop {
            let frame = tokio::select! {
                read = timeout(self.read_timeout, wire::read_frame(&mut reader, max_frame)) => {
                    read.map_err(|_| Error::peer_at("read timed out", self.addr))??
                }
                _ = self.shutdown.notified() => {
                    return Err(Error::peer_at("connection closed", self.addr).into());
                }
            };

            if frame.is_empty() {
                trace!("keep-alive from {}", self.addr);
                continue;
            }

            let id = match MessageId::try_from(frame[0]) {
                Ok(id) => id,
                Err(other) => {
                    debug!(
                        "unknown message type {} from {}, {} bytes discarded",
                        other,
                        self.addr,
                        frame.len() - 1
                    );
                    first = false;
                    continue;
                }
            };
            let message = Message::decode(id, &frame[1..])?;
            trace!("received {:?} from {}", id, self.addr);

            match message {
                Message::KeepAlive => unreachable!("empty frames are handled above"),
                Message::Choke => self.set_peer_choking(true).await,
                Message::Unchoke => self.set_peer_choking(false).await,
                Message::Interested => self.peer_interested.store(true, Ordering::SeqCst),
                Message::NotInterested => self.peer_interested.store(false, Ordering::SeqCst),
                Message::Have { index } => {
                    if index >= piece_count {
                        return Err(Error::protocol("unexpected piece index").into());
                    }
                    remote_have.set(index);
                    debug!("peer {} has piece #{}", self.addr, index);
                    transfer.notify_have(self.clone(), index).await?;
                }
                Message::Bitfield { bytes } => {
                    if !first {
                        return Err(
                            Error::protocol("bitfield can only be sent after handshake").into()
                        );
                    }
                    remote_have.fill_from(&bytes)?;
                    debug!("peer {} bitfield: {}", self.addr, remote_have.to_hex());
                    for index in 0..piece_count {
                        if remote_have.test(index) {
                            transfer.notify_have(self.clone(), index).await?;
                        }
                    }
                }
                Message::Request { length, .. } => {
                    // We never unchoke, so nothing is owed; but a peer asking
                    // for more than a block is dropped.
                    if length > BLOCK_SIZE {
                        return Err(Error::protocol("requested block too large").into());
                    }
                }
                Message::Cancel { .. } | Message::Port { .. } => {}
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    if index >= piece_count {
                        return Err(Error::protocol("unexpected piece index").into());
                    }
                    if begin % BLOCK_SIZE != 0 {
                        return Err(Error::protocol("unexpected piece offset").into());
                    }
                    let piece = transfer.piece(index);
                    let block_index = begin / BLOCK_SIZE;
                    let declared = match piece.block(block_index) {
                        Some(b) => b.length,
                        None => return Err(Error::protocol("unexpected piece offset").into()),
                    };
                    if block.len() != declared as usize {
                        return Err(Error::protocol("unexpected block size").into());
                    }
                    piece
                        .block_tx
                        .send(PeerBlock {
                            peer: self.clone(),
                            block_index,
                            data: block,
                        })
                        .await
                        .map_err(|_| Error::peer_at("block channel closed", self.addr))?;
                }
            }

            first = false;
        }
    }

    async fn set_peer_choking(&self, choking: bool) {
        let mut state = self.state.lock().await;
        state.peer_choking = choking;
        state.unchoked_tx.send_replace(!choking);
    }

    /// Declare interest and hand back the unchoke signal.
    ///
    /// INTERESTED goes out at most once per connection. If the peer is not
    /// choking us the returned signal is already satisfied. The watch carries
    /// the current unchoked state, so waiters parked during a choked interval
    /// observe only future unchokes.
    pub async fn be_interested(&self) -> anyhow::Result<watch::Receiver<bool>> {
        let mut state = self.state.lock().await;
        let unchoked = state.unchoked_tx.subscribe();

        if !state.peer_choking {
            return Ok(unchoked);
        }
        if !state.interested_sent {
            state.interested_sent = true;
            self.am_interested.store(true, Ordering::SeqCst);
            self.send(&Message::Interested).await?;
        }
        Ok(unchoked)
    }

    /// Download one piece from this peer, block by block.
    ///
    /// Holds the piece's block receiver for the whole attempt, which is what
    /// keeps a second downloader off the same piece.
    pub async fn download_piece(&self, piece: &Piece, transfer: &Transfer) -> anyhow::Result<()> {
        debug!("downloading piece #{} from {}", piece.index, self.addr);

        let mut block_rx = piece.block_rx.lock().await;

        let mut unchoked = self.be_interested().await?;
        let wait_outcome = match timeout(self.unchoke_timeout, unchoked.wait_for(|u| *u)).await {
            Ok(Ok(_)) => 0,
            Ok(Err(_)) => 1,
            Err(_) => 2,
        };
        match wait_outcome {
            0 => {}
            1 => {
                return Err(Error::peer_at("connection lost", self.addr).into());
            }
            _ => {
                self.close().await;
                return Err(Error::peer_at("peer did not unchoke", self.addr).into());
            }
        }

        let mut data = vec![0u8; piece.length as usize];
        for block in &piece.blocks {
            self.send_request(piece.index, block.offset_in_piece(), block.length)
                .await?;
            match timeout(self.block_timeout, block_rx.recv()).await {
                Err(_) => {
                    // Abandon this attempt's block; the piece fails the hash
                    // check below and is re-dispatched.
                    warn!(
                        "peer {} did not send piece #{} block #{}",
                        self.addr, piece.index, block.index
                    );
                }
                Ok(None) => {
                    return Err(Error::peer_at("block channel closed", self.addr).into());
                }
                Ok(Some(received)) => {
                    if received.data.len() != block.length as usize {
                        return Err(Error::protocol("unexpected block length").into());
                    }
                    trace!(
                        "received piece #{} block #{} ({} bytes)",
                        piece.index,
                        block.index,
                        received.data.len()
                    );
                    let offset = block.offset_in_piece() as usize;
                    data[offset..offset + received.data.len()].copy_from_slice(&received.data);
                    transfer
                        .files()
                        .write(piece.offset + block.offset_in_piece() as u64, &received.data)
                        .await?;
                    piece.mark_block(block.index);
                }
            }
        }

        if !piece.verify(&data) {
            return Err(Error::peer_at("received corrupt piece", self.addr).into());
        }

        piece.mark_downloaded();
        info!("piece #{} downloaded from {}", piece.index, self.addr);
        Ok(())
    }

    /// Send our bitfield; the first write on every connection
    pub async fn send_bitfield(&self, bitfield: &Bitfield) -> anyhow::Result<()> {
        self.send(&Message::Bitfield {
            bytes: bitfield.as_bytes().to_vec(),
        })
        .await
    }

    /// Send a REQUEST for `length` bytes at `begin` within piece `index`
    pub async fn send_request(&self, index: u32, begin: u32, length: u32) -> anyhow::Result<()> {
        self.send(&Message::Request {
            index,
            begin,
            length,
        })
        .await
    }

    async fn send(&self, message: &Message) -> anyhow::Result<()> {
        trace!("sending {:?} to {}", message.id(), self.addr);
        let mut writer = self.writer.lock().await;
        wire::write_message(&mut *writer, message).await?;
        Ok(())
    }

    /// Tear the connection down: wake the message loop and shut the socket
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let mut writer = self.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_initial_flags() {
        let (local, _remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());

        assert!(conn.am_choking());
        assert!(!conn.am_interested());
        assert!(!conn.peer_interested());
        assert!(conn.peer_choking().await);
        assert!(!conn.is_disconnected());
    }

    #[tokio::test]
    async fn test_be_interested_sends_once() {
        let (local, mut remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());

        let _rx1 = conn.be_interested().await.unwrap();
        let _rx2 = conn.be_interested().await.unwrap();
        assert!(conn.am_interested());

        // Exactly one INTERESTED frame on the wire.
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 2]);

        conn.close().await;
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_be_interested_when_already_unchoked_is_silent() {
        let (local, mut remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());

        conn.set_peer_choking(false).await;
        let mut rx = conn.be_interested().await.unwrap();
        // Signal already satisfied, nothing sent.
        rx.wait_for(|u| *u).await.unwrap();
        assert!(!conn.am_interested());

        conn.close().await;
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unchoke_signal_fires_waiters() {
        let (local, _remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());

        let mut rx = conn.be_interested().await.unwrap();
        let waiter = tokio::spawn(async move { rx.wait_for(|u| *u).await.map(|_| ()) });

        conn.set_peer_choking(false).await;
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_choke_rearms_the_signal() {
        let (local, _remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());

        conn.set_peer_choking(false).await;
        conn.set_peer_choking(true).await;

        // A waiter subscribing during the choked interval must not see the
        // stale unchoke.
        let mut rx = conn.be_interested().await.unwrap();
        assert!(
            timeout(std::time::Duration::from_millis(50), rx.wait_for(|u| *u))
                .await
                .is_err()
        );

        conn.set_peer_choking(false).await;
        rx.wait_for(|u| *u).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_request_frame_bytes() {
        let (local, mut remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());

        conn.send_request(1, 16384, 16384).await.unwrap();
        let mut buf = [0u8; 17];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &13u32.to_be_bytes());
        assert_eq!(buf[4], 6);
        assert_eq!(&buf[5..9], &1u32.to_be_bytes());
        assert_eq!(&buf[9..13], &16384u32.to_be_bytes());
        assert_eq!(&buf[13..17], &16384u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_close_unblocks_nothing_sent_after() {
        let (local, mut remote) = connected_pair().await;
        let (conn, _reader) = PeerConnection::new(local, &Config::default());
        conn.close().await;
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
