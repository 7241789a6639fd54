//! torrent-transfer - Main entry point
//!
//! Loads a torrent, starts the transfer and logs its notifications until the
//! selector is complete or Ctrl-C is pressed.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use torrent_transfer::{
    CliArgs, PeerManager, StaticTracker, TorrentInfo, TorrentParser, TrackerClient, TransferConfig, TransferEvent,
};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let info = load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?;

    let mut config = match &args.config {
        Some(path) => TransferConfig::load(path).context("Failed to load configuration")?,
        None => TransferConfig::default(),
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.validate().context("Invalid configuration")?;

    display_torrent_info(&info, &config);

    let tracker = build_tracker(&args, &info)?;
    let manager = PeerManager::new(info, &config, tracker).context("Failed to create transfer")?;
    let mut events = manager.subscribe();
    manager.start()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                manager.stop();
            }
            event = events.recv() => match event {
                Ok(TransferEvent::PieceComplete(index)) => {
                    let selector = manager.selector();
                    info!(
                        "Piece {} complete ({} of {} blocks)",
                        index,
                        selector.available(),
                        selector.block_count()
                    );
                    if selector.is_complete() {
                        info!("All pieces complete");
                        manager.stop();
                    }
                }
                Ok(TransferEvent::PeersChanged) => {
                    let registry = manager.registry();
                    debug!("Peers: {} registered, {} active", registry.len(), registry.active_count());
                }
                Ok(TransferEvent::ConnectionException(message)) => warn!("Connection exception: {}", message),
                Ok(TransferEvent::Stopping) => break,
                Ok(event) => debug!("Event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} notifications", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.wait().await;
    info!("torrent-transfer finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    let info = TorrentParser::parse_file(path)?;
    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Peers given on the command line bypass the tracker
fn build_tracker(args: &CliArgs, info: &TorrentInfo) -> Result<Arc<dyn TrackerClient>> {
    if !args.peers.is_empty() {
        info!("Using {} peers from the command line", args.peers.len());
        return Ok(Arc::new(StaticTracker::new(args.peers.clone())));
    }

    #[cfg(feature = "http-tracker")]
    let tracker: Arc<dyn TrackerClient> = Arc::new(torrent_transfer::HttpTracker::new(info.announce_urls())?);

    #[cfg(not(feature = "http-tracker"))]
    let tracker: Arc<dyn TrackerClient> = {
        warn!("Built without tracker support and no --peer given for {}", info.name);
        Arc::new(StaticTracker::default())
    };

    Ok(tracker)
}

fn display_torrent_info(info: &TorrentInfo, config: &TransferConfig) {
    println!("Torrent Information:");
    println!("  Name: {}", info.name);
    println!("  Size: {} bytes", info.total_size());
    println!("  Pieces: {} of {} bytes", info.piece_count(), info.piece_length);
    println!("  Info hash: {}", info.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Listen port: {}", config.listen_port);
    println!("  Block size: {}", config.block_size);
    println!("  Pending requests per peer: {}", config.max_pending_requests);
    println!();
}
