//! Tracker announce: trait, parameter types and scheme dispatch.

pub mod http;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::Error;
use crate::{InfoHash, PeerId};

pub use http::HttpTracker;

/// Floor for tracker-provided announce intervals
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Announce events reported to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

/// Parameters of one announce request
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub num_want: usize,
}

/// Result of one announce request
#[derive(Debug, Clone)]
pub struct Announce {
    /// Interval the tracker asked us to wait before the next announce
    pub interval: Duration,
    /// Peer addresses for this info hash
    pub peers: Vec<SocketAddr>,
}

/// A peer source for one torrent
#[async_trait]
pub trait Tracker: Send + Sync + std::fmt::Debug {
    /// Announce our state and collect a batch of peer addresses
    async fn announce(&mut self, params: AnnounceParams) -> Result<Announce, Error>;
}

/// Build a tracker client for an announce URL.
///
/// Only HTTP(S) trackers are supported; anything else fails transfer
/// creation.
pub fn create(announce: &str) -> Result<Box<dyn Tracker>, Error> {
    let url = Url::parse(announce)
        .map_err(|e| Error::tracker_at(format!("invalid announce url: {}", e), announce))?;
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(url))),
        other => Err(Error::tracker_at(
            format!("unsupported tracker scheme {:?}", other),
            announce,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_http_tracker() {
        assert!(create("http://tracker.test/announce").is_ok());
        assert!(create("https://tracker.test/announce").is_ok());
    }

    #[test]
    fn test_create_rejects_udp() {
        let err = create("udp://tracker.test:6969/announce").unwrap_err();
        assert!(err.to_string().contains("unsupported tracker scheme"));
    }

    #[test]
    fn test_create_rejects_garbage() {
        assert!(create("not a url").is_err());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(Event::Started.to_string(), "started");
        assert_eq!(Event::Completed.to_string(), "completed");
        assert_eq!(Event::Stopped.to_string(), "stopped");
    }
}
