//! Engine configuration.
//!
//! Carries the dial limits and the protocol deadlines so integration tests
//! can shorten waits that would otherwise take minutes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Peers requested from the tracker per announce; also sizes the dial queue.
pub const NUM_WANT: usize = 50;

/// Configuration for a transfer
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub dest_dir: PathBuf,
    /// Listen port reported to the tracker and bound for inbound peers
    pub port: u16,
    /// Maximum concurrent peer sessions per transfer
    pub max_peers: usize,
    /// Peers requested per announce
    pub num_want: usize,
    /// Rolling deadline for each frame read
    pub read_timeout: Duration,
    /// End-to-end deadline for the handshake exchange
    pub handshake_timeout: Duration,
    /// How long a piece download waits to be unchoked
    pub unchoke_timeout: Duration,
    /// How long a piece download waits for each requested block
    pub block_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from("."),
            port: 6881,
            max_peers: 20,
            num_want: NUM_WANT,
            read_timeout: Duration::from_secs(3 * 60),
            handshake_timeout: Duration::from_secs(60),
            unchoke_timeout: Duration::from_secs(60),
            block_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("port cannot be 0"));
        }
        if self.max_peers == 0 {
            return Err(anyhow::anyhow!("max_peers must be at least 1"));
        }
        if self.num_want == 0 {
            return Err(anyhow::anyhow!("num_want must be at least 1"));
        }
        if self.dest_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("dest_dir cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.num_want, 50);
        assert_eq!(config.read_timeout, Duration::from_secs(180));
        assert_eq!(config.unchoke_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_max_peers() {
        let config = Config {
            max_peers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
