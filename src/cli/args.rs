//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the downloader
#[derive(Debug, Parser)]
#[command(name = "leech")]
#[command(about = "Download-only BitTorrent client", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR", default_value = "./downloads")]
    pub output_dir: PathBuf,

    /// Port reported to trackers
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of concurrent peer connections
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Outstanding block requests per connection
    #[arg(long, default_value_t = 5)]
    pub pipeline_depth: usize,

    /// Seconds allowed for a TCP connect and handshake
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds allowed for each message read from a peer
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub read_timeout: u64,

    /// Seconds allowed per tracker request attempt
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub tracker_timeout: u64,

    /// Seconds between announce rounds while under the connection limit
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub reannounce: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, conflicts_with = "verbose")]
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

    pub fn is_quiet(&self) -> bool {
        self.quiet
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
