//! Process-wide transfer registry.
//!
//! Transfers register under their info hash for the lifetime of their run so
//! inbound handshakes can find them. Registration is the first act of a run;
//! the guard makes deregistration unconditional on exit.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use crate::error::Error;
use crate::transfer::Transfer;
use crate::InfoHash;

static TRANSFERS: LazyLock<Mutex<HashMap<InfoHash, Weak<Transfer>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Removes its transfer from the registry on drop
#[derive(Debug)]
pub struct Registration {
    info_hash: InfoHash,
}

impl Drop for Registration {
    fn drop(&mut self) {
        TRANSFERS.lock().unwrap().remove(&self.info_hash);
    }
}

/// Register a transfer; fails if one is already running for the info hash
pub fn register(transfer: &Arc<Transfer>) -> Result<Registration, Error> {
    let info_hash = transfer.info_hash();
    let mut map = TRANSFERS.lock().unwrap();
    if let Some(existing) = map.get(&info_hash) {
        if existing.strong_count() > 0 {
            return Err(Error::validation(format!(
                "a transfer is already registered for info hash {}",
                hex::encode(info_hash)
            )));
        }
    }
    map.insert(info_hash, Arc::downgrade(transfer));
    Ok(Registration { info_hash })
}

/// Look up the running transfer for an info hash
pub fn lookup(info_hash: &InfoHash) -> Option<Arc<Transfer>> {
    TRANSFERS.lock().unwrap().get(info_hash)?.upgrade()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::Handshake;
    use crate::torrent::Metainfo;

    async fn test_transfer(info_hash: InfoHash) -> (Arc<Transfer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = Metainfo {
            announce: String::new(),
            info_hash,
            piece_length: 16384,
            pieces: vec![[0u8; 20]],
            name: format!("reg-{}.bin", hex::encode(&info_hash[..4])),
            length: Some(16384),
            files: None,
        };
        let config = Config {
            dest_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let transfer = Transfer::new(Arc::new(meta), Handshake::generate_peer_id(), config)
            .await
            .unwrap();
        (transfer, dir)
    }

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let (transfer, _dir) = test_transfer([0xA1; 20]).await;

        let registration = register(&transfer).unwrap();
        let found = lookup(&[0xA1; 20]).expect("registered transfer");
        assert_eq!(found.info_hash(), [0xA1; 20]);

        drop(registration);
        assert!(lookup(&[0xA1; 20]).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (first, _dir1) = test_transfer([0xA2; 20]).await;
        let (second, _dir2) = test_transfer([0xA2; 20]).await;

        let _registration = register(&first).unwrap();
        let err = register(&second).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_lookup_after_transfer_dropped() {
        let (transfer, _dir) = test_transfer([0xA3; 20]).await;
        let _registration = register(&transfer).unwrap();
        drop(transfer);
        assert!(lookup(&[0xA3; 20]).is_none());
    }

    #[tokio::test]
    async fn test_lookup_unknown_hash() {
        assert!(lookup(&[0xA4; 20]).is_none());
    }
}
