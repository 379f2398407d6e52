//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

/// CLI arguments for the downloader
#[derive(Debug, Parser)]
#[command(name = "undertow")]
#[command(about = "A BitTorrent download engine", long_about = None)]
pub struct Args {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of concurrent peer connections
    #[arg(short = 'c', long, default_value_t = 20)]
    pub max_peers: usize,

    /// Do not accept inbound peer connections
    #[arg(long)]
    pub no_listen: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Parse CLI arguments from the command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Log level derived from the verbosity flags
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Build the engine configuration
    pub fn to_config(&self) -> Config {
        Config {
            dest_dir: self
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            port: self.port,
            max_peers: self.max_peers,
            ..Config::default()
        }
    }
}
