//! CLI module
//!
//! Argument parsing, configuration and terminal progress output.

pub mod args;
pub mod config;
pub mod progress;

pub use args::CliArgs;
pub use config::Config;
pub use progress::{DownloadStats, ProgressDisplay};
