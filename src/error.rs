//! Error types for the download engine.
//!
//! One enum covers every failure class; connection-level errors are logged
//! and contained at the connection, transfer-level errors surface to the
//! caller of `Transfer::run`.

use std::fmt;

/// Error type for engine operations
#[derive(Debug, Clone)]
pub enum Error {
    /// Metainfo / bencode parsing errors
    Parse {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol violations
    Protocol {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors (transport failures, timeouts, misbehavior)
    Peer {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// File I/O and allocation errors
    Storage {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    Tracker {
        message: String,
        url: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    Config {
        message: String,
        field: Option<String>,
    },

    /// Validation errors (registry conflicts, inconsistent metainfo)
    Validation {
        message: String,
        field: Option<String>,
    },
}

impl Error {
    /// Create a new Parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new Parse error with source
    pub fn parse_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new Protocol error with source
    pub fn protocol_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new Peer error
    pub fn peer(message: impl Into<String>) -> Self {
        Error::Peer {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new Peer error with the peer address
    pub fn peer_at(message: impl Into<String>, peer: impl ToString) -> Self {
        Error::Peer {
            message: message.into(),
            peer: Some(peer.to_string()),
            source: None,
        }
    }

    /// Create a new Peer error with source
    pub fn peer_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Error::Peer {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    /// Create a new Storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new Storage error with path and source
    pub fn storage_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Error::Storage {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new Tracker error
    pub fn tracker(message: impl Into<String>) -> Self {
        Error::Tracker {
            message: message.into(),
            url: None,
            source: None,
        }
    }

    /// Create a new Tracker error with the announce URL
    pub fn tracker_at(message: impl Into<String>, url: impl Into<String>) -> Self {
        Error::Tracker {
            message: message.into(),
            url: Some(url.into()),
            source: None,
        }
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new Config error with field
    pub fn config_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse { message, source } => {
                if let Some(src) = source {
                    write!(f, "parse error: {} ({})", message, src)
                } else {
                    write!(f, "parse error: {}", message)
                }
            }
            Error::Protocol { message, source } => {
                if let Some(src) = source {
                    write!(f, "protocol error: {} ({})", message, src)
                } else {
                    write!(f, "protocol error: {}", message)
                }
            }
            Error::Peer {
                message,
                peer,
                source,
            } => match (peer, source) {
                (Some(p), Some(s)) => write!(f, "peer error: {} (peer: {}, {})", message, p, s),
                (Some(p), None) => write!(f, "peer error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "peer error: {} ({})", message, s),
                (None, None) => write!(f, "peer error: {}", message),
            },
            Error::Storage {
                message,
                path,
                source,
            } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "storage error: {} (path: {}, {})", message, p, s),
                (Some(p), None) => write!(f, "storage error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "storage error: {} ({})", message, s),
                (None, None) => write!(f, "storage error: {}", message),
            },
            Error::Tracker {
                message,
                url,
                source,
            } => match (url, source) {
                (Some(u), Some(s)) => write!(f, "tracker error: {} (url: {}, {})", message, u, s),
                (Some(u), None) => write!(f, "tracker error: {} (url: {})", message, u),
                (None, Some(s)) => write!(f, "tracker error: {} ({})", message, s),
                (None, None) => write!(f, "tracker error: {}", message),
            },
            Error::Config { message, field } => {
                if let Some(field) = field {
                    write!(f, "config error: {} (field: {})", message, field)
                } else {
                    write!(f, "config error: {}", message)
                }
            }
            Error::Validation { message, field } => {
                if let Some(field) = field {
                    write!(f, "validation error: {} (field: {})", message, field)
                } else {
                    write!(f, "validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(err: serde_bencode::Error) -> Self {
        Error::parse_with_source("failed to decode bencode data", err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Tracker {
            message: "announce request failed".to_string(),
            url: err.url().map(|u| u.to_string()),
            source: Some(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = Error::parse("missing info dictionary");
        assert_eq!(err.to_string(), "parse error: missing info dictionary");
    }

    #[test]
    fn test_parse_error_with_source() {
        let err = Error::parse_with_source("bad torrent", "unexpected end of data");
        assert!(err.to_string().contains("bad torrent"));
        assert!(err.to_string().contains("unexpected end of data"));
    }

    #[test]
    fn test_peer_error_with_addr() {
        let err = Error::peer_at("peer did not unchoke", "127.0.0.1:6881");
        assert!(err.to_string().contains("peer did not unchoke"));
        assert!(err.to_string().contains("127.0.0.1:6881"));
    }

    #[test]
    fn test_storage_error_full() {
        let err = Error::storage_full("failed to create file", "/dl/a.bin", "permission denied");
        assert!(err.to_string().contains("failed to create file"));
        assert!(err.to_string().contains("/dl/a.bin"));
    }

    #[test]
    fn test_tracker_error_with_url() {
        let err = Error::tracker_at("unsupported tracker scheme", "udp://t.example/ann");
        assert!(err.to_string().contains("unsupported tracker scheme"));
        assert!(err.to_string().contains("udp://t.example/ann"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = Error::config_field("must be at least 1", "max_peers");
        assert!(err.to_string().contains("max_peers"));
    }
}
