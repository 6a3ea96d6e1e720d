//! CLI configuration module
//!
//! Turns parsed arguments into the plain settings the engine consumes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::cli::args::CliArgs;
use crate::engine::EngineSettings;
use crate::error::TorrentError;
use crate::peer::ConnectionSettings;
use crate::tracker::TrackerSettings;

/// Configuration for one download run
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub output_dir: PathBuf,
    /// Port reported to trackers
    pub port: u16,
    /// Maximum number of peer connections
    pub max_connections: usize,
    /// Outstanding requests per connection
    pub pipeline_depth: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub tracker_timeout: Duration,
    /// Interval between announce rounds
    pub reannounce_interval: Duration,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            output_dir: args.output_dir.clone(),
            port: args.port,
            max_connections: args.max_connections,
            pipeline_depth: args.pipeline_depth,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            read_timeout: Duration::from_secs(args.read_timeout),
            tracker_timeout: Duration::from_secs(args.tracker_timeout),
            reannounce_interval: Duration::from_secs(args.reannounce),
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_connections must be at least 1",
                "max_connections",
            )
            .into());
        }
        if self.pipeline_depth == 0 {
            return Err(TorrentError::config_error_with_field(
                "pipeline_depth must be at least 1",
                "pipeline_depth",
            )
            .into());
        }
        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("tracker_timeout", self.tracker_timeout),
            ("reannounce", self.reannounce_interval),
        ] {
            if value.is_zero() {
                return Err(TorrentError::config_error_with_field(format!("{} must be non-zero", field), field).into());
            }
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("output_dir cannot be empty", "output_dir").into());
        }
        debug!("Configuration valid: {:?}", self);
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            pipeline_depth: self.pipeline_depth,
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            listen_port: self.port,
            timeout: self.tracker_timeout,
            ..TrackerSettings::default()
        }
    }

    /// Everything the engine needs for one run
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            output_dir: self.output_dir.clone(),
            connection: self.connection_settings(),
            tracker: self.tracker_settings(),
            max_connections: self.max_connections,
            reannounce_interval: self.reannounce_interval,
            ..EngineSettings::default()
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
