//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// CLI arguments for the transfer binary
#[derive(Debug, Parser)]
#[command(name = "torrent-transfer")]
#[command(about = "Fetch the blocks of a torrent from its peers", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Listening port for incoming connections (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Dial this peer instead of asking the tracker (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_arguments() {
        let args = CliArgs::try_parse_from(["torrent-transfer", "sample.torrent"]).unwrap();
        assert_eq!(args.torrent_file, PathBuf::from("sample.torrent"));
        assert!(args.port.is_none());
        assert!(args.peers.is_empty());
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_repeated_peers_and_port() {
        let args = CliArgs::try_parse_from([
            "torrent-transfer",
            "sample.torrent",
            "--port",
            "7000",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "10.0.0.2:51413",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["torrent-transfer", "a.torrent", "-v", "-q"]).is_err());
        assert!(CliArgs::try_parse_from(["torrent-transfer", "a.torrent", "--peer", "nope"]).is_err());
    }
}
