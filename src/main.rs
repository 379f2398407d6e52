//! undertow - main entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use undertow::cli::Args;
use undertow::protocol::Handshake;
use undertow::torrent::Metainfo;
use undertow::transfer;
use undertow::Transfer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    init_logging(&args);

    let meta = Metainfo::from_file(&args.torrent_file).context("failed to load torrent file")?;
    let config = args.to_config();
    config.validate().context("invalid configuration")?;

    if !args.quiet {
        print_summary(&meta, &config);
    }

    let peer_id = Handshake::generate_peer_id();
    let transfer = Transfer::new(Arc::new(meta), peer_id, config.clone())
        .await
        .context("failed to create transfer")?;

    if !args.no_listen {
        match TcpListener::bind(("0.0.0.0", config.port)).await {
            Ok(listener) => {
                tokio::spawn(transfer::accept_peers(listener));
            }
            Err(e) => warn!("cannot listen on port {}: {}", config.port, e),
        }
    }

    transfer.run().await.context("transfer failed")?;

    info!("download finished");
    if !args.quiet {
        println!(
            "Downloaded {:?} ({} bytes) to {}",
            transfer.name(),
            transfer.downloaded(),
            config.dest_dir.display()
        );
    }
    Ok(())
}

fn init_logging(args: &Args) {
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .compact()
        .init();
}

fn print_summary(meta: &Metainfo, config: &undertow::Config) {
    println!("Torrent:");
    println!("  Name: {}", meta.name);
    println!("  Size: {} bytes", meta.total_size());
    println!(
        "  Pieces: {} x {} bytes",
        meta.piece_count(),
        meta.piece_length
    );
    println!("  Info hash: {}", meta.info_hash_hex());
    if meta.announce.is_empty() {
        println!("  Tracker: none");
    } else {
        println!("  Tracker: {}", meta.announce);
    }
    println!("Configuration:");
    println!("  Output directory: {}", config.dest_dir.display());
    println!("  Listen port: {}", config.port);
    println!("  Max peers: {}", config.max_peers);
    println!();
}
