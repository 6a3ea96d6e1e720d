//! Torrent metadata module
//!
//! Parsing and validation of .torrent files.

pub mod descriptor;
pub mod parser;

pub use descriptor::{generate_peer_id, FileEntry, TorrentDescriptor, BLOCK_SIZE};
pub use parser::TorrentParser;
