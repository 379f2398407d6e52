//! Piece dispatch loop.
//!
//! One sequential loop per transfer: find the first piece that still needs
//! downloading and has a connected peer advertising it, run the download,
//! record the result. Parks on the transfer's notify when nothing is
//! eligible; the supervisor nudges it on every new peer-have.

use std::sync::Arc;

use tracing::debug;

use super::Transfer;
use crate::peer::PeerConnection;
use crate::storage::Piece;

pub(crate) async fn run(transfer: Arc<Transfer>) {
    loop {
        match next_download(&transfer) {
            Some((piece, peer)) => {
                match peer.download_piece(&piece, &transfer).await {
                    Ok(()) => {
                        if transfer.record_downloaded(piece.index) {
                            transfer.completed_tx.send_replace(true);
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(
                            "piece #{} from {} failed: {:#}",
                            piece.index,
                            peer.addr(),
                            e
                        );
                    }
                }
            }
            None => transfer.dispatch.notified().await,
        }
    }
}

/// First not-yet-downloaded piece with a connected peer, lowest index wins.
/// Disconnected peers are pruned from the piece's list on the way.
fn next_download(transfer: &Transfer) -> Option<(Arc<Piece>, Arc<PeerConnection>)> {
    for piece in transfer.pieces() {
        if piece.is_downloaded() {
            continue;
        }
        let mut peers = piece.peers.lock().unwrap();
        peers.retain(|p| !p.is_disconnected());
        if let Some(peer) = peers.first() {
            return Some((piece.clone(), peer.clone()));
        }
    }
    None
}
