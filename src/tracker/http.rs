//! HTTP(S) tracker announce client.
//!
//! The query string carries the binary info hash and peer id urlencoded;
//! the response is a bencoded dictionary with peers in either the compact
//! string form or the dictionary-list form.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use serde::de;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{Announce, AnnounceParams, Tracker, MIN_ANNOUNCE_INTERVAL};
use crate::error::Error;

/// HTTP announce client for one tracker URL
#[derive(Debug)]
pub struct HttpTracker {
    client: reqwest::Client,
    url: Url,
    tracker_id: Option<String>,
}

impl HttpTracker {
    /// Create a client for `url`
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            tracker_id: None,
        }
    }

    fn announce_url(&self, params: &AnnounceParams) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.num_want,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        url
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&mut self, params: AnnounceParams) -> Result<Announce, Error> {
        let url = self.announce_url(&params);
        debug!("announce url: {}", url);

        let raw = self
            .client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = serde_bencode::de::from_bytes(&raw).map_err(|e| {
            Error::Tracker {
                message: "failed to decode announce response".to_string(),
                url: Some(self.url.to_string()),
                source: Some(e.to_string()),
            }
        })?;
        debug!(
            "announce response: {} peers, interval {:?}",
            resp.peers.len(),
            resp.interval
        );

        if let Some(failure) = resp.failure_reason {
            return Err(Error::tracker_at(failure, self.url.to_string()));
        }
        if let Some(warning) = resp.warning_message {
            warn!("tracker warning: {}", warning);
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.tracker_id = Some(tracker_id);
        }

        let interval = resp
            .interval
            .map(Duration::from_secs)
            .unwrap_or(MIN_ANNOUNCE_INTERVAL)
            .max(MIN_ANNOUNCE_INTERVAL);

        Ok(Announce {
            interval,
            peers: resp.peers,
        })
    }
}

#[derive(Deserialize, Debug, Default)]
struct HttpResponse {
    // Present alone when the request failed; human-readable reason.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    // Processed normally, but shown to the operator.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Seconds to wait between regular announces.
    interval: Option<u64>,

    // Echoed back on subsequent announces when present.
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    peers: Vec<SocketAddr>,
}

// The tracker answers with either the compact string model or a list of
// dictionaries, regardless of what compact=1 asked for.
fn deserialize_peers<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        // Compact model: 6 bytes per peer, 4-byte IPv4 + 2-byte port,
        // network byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer string not a multiple of 6"));
            }
            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&v)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(v.as_bytes())
        }

        // Dictionary model: entries with "ip" and "port" keys.
        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(item) = seq.next_element::<PeerItem>()? {
                match item.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, item.port)),
                    Err(_) => continue,
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_compact_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]); // 127.0.0.1:6881
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]); // 10.0.0.2:6882
        body.extend_from_slice(b"e");

        let resp: HttpResponse = serde_bencode::de::from_bytes(&body).unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(resp.peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn test_decode_dictionary_response() {
        let body =
            b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip7:8.8.8.84:porti51413eeee";
        let resp: HttpResponse = serde_bencode::de::from_bytes(body).unwrap();
        assert_eq!(resp.interval, Some(900));
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[1], "8.8.8.8:51413".parse().unwrap());
    }

    #[test]
    fn test_decode_failure_response() {
        let body = b"d14:failure reason15:torrent unknowne";
        let resp: HttpResponse = serde_bencode::de::from_bytes(body).unwrap();
        assert_eq!(resp.failure_reason.as_deref(), Some("torrent unknown"));
        assert!(resp.peers.is_empty());
    }

    #[test]
    fn test_decode_rejects_ragged_compact_string() {
        let body = b"d8:intervali1800e5:peers5:aaaaae";
        assert!(serde_bencode::de::from_bytes::<HttpResponse>(body).is_err());
    }

    #[test]
    fn test_announce_url_shape() {
        let tracker = HttpTracker::new(Url::parse("http://t.test/announce").unwrap());
        let url = tracker.announce_url(&AnnounceParams {
            info_hash: [0xff; 20],
            peer_id: [b'a'; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 100,
            left: 900,
            event: Some(super::super::Event::Started),
            num_want: 50,
        });
        assert!(url.starts_with("http://t.test/announce?info_hash=%FF"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&downloaded=100"));
        assert!(url.contains("&left=900"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
        assert!(url.ends_with("&event=started"));
    }
}
