//! Transfer supervisor.
//!
//! One `Transfer` drives the download of one torrent: it registers itself by
//! info hash, feeds tracker batches into a bounded dial queue, runs a
//! concurrency-capped connecter, fans peer-have events into the per-piece
//! peer lists and wakes the dispatcher. Inbound connections are served by
//! `accept_peers`, which finds the transfer through the registry.

mod dispatcher;
mod queue;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::error::Error;
use crate::peer::PeerConnection;
use crate::protocol::{wire, Handshake};
use crate::registry;
use crate::storage::{build_pieces, FileMap, Piece};
use crate::torrent::Metainfo;
use crate::tracker::{self, AnnounceParams, Event, Tracker};
use crate::{InfoHash, PeerId};

use queue::PeerQueue;

/// A peer announcing that it has a piece; produced by connection read loops,
/// consumed by the supervisor
pub struct PeerHave {
    pub peer: Arc<PeerConnection>,
    pub piece: Arc<Piece>,
}

/// An active download of one torrent
#[derive(Debug)]
pub struct Transfer {
    meta: Arc<Metainfo>,
    peer_id: PeerId,
    config: Config,
    pieces: Vec<Arc<Piece>>,
    files: Arc<FileMap>,
    bitfield: StdMutex<Bitfield>,
    tracker: tokio::sync::Mutex<Option<Box<dyn Tracker>>>,
    have_tx: mpsc::Sender<PeerHave>,
    have_rx: tokio::sync::Mutex<Option<mpsc::Receiver<PeerHave>>>,
    peer_queue: PeerQueue,
    dispatch: Notify,
    completed_tx: watch::Sender<bool>,
}

impl Transfer {
    /// Create a transfer: build the tracker client, pre-allocate the file
    /// set and lay out the piece table. Any failure here aborts the transfer
    /// before a single task is spawned.
    pub async fn new(
        meta: Arc<Metainfo>,
        peer_id: PeerId,
        config: Config,
    ) -> anyhow::Result<Arc<Self>> {
        let tracker = if meta.announce.is_empty() {
            None
        } else {
            Some(tracker::create(&meta.announce)?)
        };

        let files = Arc::new(FileMap::allocate(&meta, &config.dest_dir).await?);
        let pieces = build_pieces(&meta);
        let piece_count = pieces.len() as u32;
        let (have_tx, have_rx) = mpsc::channel(64);
        let (completed_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            peer_queue: PeerQueue::new(config.num_want),
            meta,
            peer_id,
            config,
            pieces,
            files,
            bitfield: StdMutex::new(Bitfield::new(piece_count)),
            tracker: tokio::sync::Mutex::new(tracker),
            have_tx,
            have_rx: tokio::sync::Mutex::new(Some(have_rx)),
            dispatch: Notify::new(),
            completed_tx,
        }))
    }

    /// Info hash of the torrent being transferred
    pub fn info_hash(&self) -> InfoHash {
        self.meta.info_hash
    }

    /// Display name of the torrent
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Piece at `index`; callers validate the index against `piece_count`
    pub fn piece(&self, index: u32) -> Arc<Piece> {
        self.pieces[index as usize].clone()
    }

    /// The full piece table
    pub fn pieces(&self) -> &[Arc<Piece>] {
        &self.pieces
    }

    /// The pre-allocated file set
    pub fn files(&self) -> &FileMap {
        &self.files
    }

    /// Copy of our piece bitfield
    pub fn bitfield_snapshot(&self) -> Bitfield {
        self.bitfield.lock().unwrap().clone()
    }

    /// Bytes of verified content
    pub fn downloaded(&self) -> u64 {
        let bitfield = self.bitfield.lock().unwrap();
        (0..bitfield.len())
            .filter(|i| bitfield.test(*i))
            .map(|i| self.meta.piece_length_at(i) as u64)
            .sum()
    }

    /// Bytes still missing
    pub fn left(&self) -> u64 {
        self.meta.total_size() - self.downloaded()
    }

    /// True once every piece is verified
    pub fn is_complete(&self) -> bool {
        self.bitfield.lock().unwrap().all()
    }

    /// Inject a peer address directly, bypassing the tracker
    pub fn add_peer(&self, addr: SocketAddr) {
        self.peer_queue.push(addr);
    }

    /// Run the transfer to completion.
    ///
    /// Registers in the process-wide registry first; the registration guard
    /// deregisters on every exit path.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let _registration = registry::register(self)?;
        info!(
            "starting transfer {:?} ({} pieces, {} bytes)",
            self.meta.name,
            self.piece_count(),
            self.meta.total_size()
        );

        let mut have_rx = self
            .have_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::validation("transfer is already running"))?;

        let (announce_tx, mut announce_rx) = mpsc::channel::<Vec<SocketAddr>>(4);
        let mut tasks = Vec::new();
        if self.tracker.lock().await.is_some() {
            tasks.push(tokio::spawn(announcer(self.clone(), announce_tx)));
        }
        tasks.push(tokio::spawn(connecter(self.clone())));
        tasks.push(tokio::spawn(dispatcher::run(self.clone())));

        let mut completed = self.completed_tx.subscribe();
        loop {
            tokio::select! {
                Some(addrs) = announce_rx.recv() => {
                    for addr in addrs {
                        debug!("peer address from tracker: {}", addr);
                        self.peer_queue.push(addr);
                    }
                }
                Some(have) = have_rx.recv() => {
                    have.piece.add_peer(have.peer);
                    self.dispatch.notify_one();
                }
                _ = completed.wait_for(|done| *done) => break,
            }
        }

        for task in &tasks {
            task.abort();
        }
        self.announce_event(Event::Completed).await;
        info!(
            "transfer {:?} finished, {} bytes written",
            self.meta.name,
            self.files.total_len()
        );
        Ok(())
    }

    /// Route a peer-have event to the supervisor
    pub(crate) async fn notify_have(
        &self,
        peer: Arc<PeerConnection>,
        index: u32,
    ) -> anyhow::Result<()> {
        let piece = self.pieces[index as usize].clone();
        self.have_tx
            .send(PeerHave { peer, piece })
            .await
            .map_err(|_| Error::peer("transfer is shutting down"))?;
        Ok(())
    }

    /// Set the bitfield bit for a verified piece; true when that was the
    /// last one. The only writer of the bitfield, always after verification.
    pub(crate) fn record_downloaded(&self, index: u32) -> bool {
        let mut bitfield = self.bitfield.lock().unwrap();
        bitfield.set(index);
        bitfield.all()
    }

    /// Dial a peer, handshake under one deadline, then serve its messages.
    /// The caller's semaphore permit spans the whole session.
    async fn connect_to_peer(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        debug!("connecting to peer {}", addr);
        let stream = timeout(self.config.handshake_timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            wire::write_handshake(&mut stream, &Handshake::new(self.meta.info_hash, self.peer_id))
                .await?;
            let theirs = wire::read_handshake(&mut stream).await?;
            if !theirs.validate(&self.meta.info_hash) {
                return Err(Error::peer_at("unexpected info hash", addr).into());
            }
            if theirs.peer_id == self.peer_id {
                return Err(Error::peer_at("rejected own connection", addr).into());
            }
            Ok::<TcpStream, anyhow::Error>(stream)
        })
        .await
        .map_err(|_| Error::peer_at("handshake timed out", addr))??;

        info!("connected to peer {}", addr);
        let (conn, reader) = PeerConnection::new(stream, &self.config);
        conn.run(reader, self).await;
        Ok(())
    }

    async fn announce_event(&self, event: Event) {
        let mut tracker = self.tracker.lock().await;
        if let Some(tracker) = tracker.as_mut() {
            let params = self.announce_params(Some(event));
            if let Err(e) = tracker.announce(params).await {
                debug!("{} announce failed: {:#}", event, e);
            }
        }
    }

    fn announce_params(&self, event: Option<Event>) -> AnnounceParams {
        AnnounceParams {
            info_hash: self.meta.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: self.downloaded(),
            left: self.left(),
            event,
            num_want: self.config.num_want,
        }
    }
}

/// Periodic tracker announces; batches go to the supervisor loop
async fn announcer(transfer: Arc<Transfer>, announce_tx: mpsc::Sender<Vec<SocketAddr>>) {
    let mut event = Some(Event::Started);
    loop {
        let params = transfer.announce_params(event.take());
        let result = {
            let mut tracker = transfer.tracker.lock().await;
            match tracker.as_mut() {
                Some(tracker) => tracker.announce(params).await,
                None => return,
            }
        };
        let interval = match result {
            Ok(announce) => {
                debug!("tracker returned {} peers", announce.peers.len());
                if announce_tx.send(announce.peers).await.is_err() {
                    return;
                }
                announce.interval
            }
            Err(e) => {
                warn!("announce failed: {:#}", e);
                tracker::MIN_ANNOUNCE_INTERVAL
            }
        };
        tokio::time::sleep(interval).await;
    }
}

/// Dial-pool worker spawner: one task per address, `max_peers` concurrent
/// sessions. A worker's slot is released when its task ends, panic included.
async fn connecter(transfer: Arc<Transfer>) {
    let limit = Arc::new(Semaphore::new(transfer.config.max_peers));
    loop {
        let addr = transfer.peer_queue.pop().await;
        let permit = match limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let transfer = transfer.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = transfer.connect_to_peer(addr).await {
                debug!("peer {} session ended: {:#}", addr, e);
            }
        });
    }
}

/// Serve inbound peer connections for whatever transfers are registered.
///
/// Each accepted socket gets one deadline to present a handshake naming a
/// registered info hash; self-connections are rejected.
pub async fn accept_peers(listener: TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!("listening for peers on {}", addr),
        Err(_) => info!("listening for peers"),
    }
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(async move {
                    if let Err(e) = handle_incoming(stream, addr).await {
                        debug!("inbound peer {}: {:#}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_incoming(mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
    let handshake_window = Config::default().handshake_timeout;
    let transfer = timeout(handshake_window, async {
        let theirs = wire::read_handshake(&mut stream).await?;
        let transfer = registry::lookup(&theirs.info_hash)
            .ok_or_else(|| Error::peer_at("no transfer for offered info hash", addr))?;
        if theirs.peer_id == transfer.peer_id {
            return Err(Error::peer_at("rejected own connection", addr).into());
        }
        wire::write_handshake(
            &mut stream,
            &Handshake::new(transfer.meta.info_hash, transfer.peer_id),
        )
        .await?;
        Ok::<Arc<Transfer>, anyhow::Error>(transfer)
    })
    .await
    .map_err(|_| Error::peer_at("handshake timed out", addr))??;

    info!("peer {} connected inbound", addr);
    let (conn, reader) = PeerConnection::new(stream, &transfer.config);
    conn.run(reader, &transfer).await;
    Ok(())
}
