//! leech
//!
//! A download-only BitTorrent engine: UDP and HTTP trackers, the peer wire
//! protocol, a shared piece scheduler and a multi-file disk writer.

pub mod bencode;
pub mod cli;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use bencode::BencodeValue;
pub use cli::{CliArgs, Config, DownloadStats, ProgressDisplay};
pub use engine::{DownloadStatus, Engine, EngineReport, EngineSettings};
pub use peer::{ConnectionSettings, PeerConnection, PeerManager};
pub use protocol::{Bitfield, Handshake, Message, MessageId};
pub use scheduler::{BlockRequest, PieceScheduler, SchedulerStats};
pub use storage::{DiskWriter, FileLayout, PieceMessage, WriterEvent, WriterReport};
pub use torrent::{FileEntry, TorrentDescriptor, TorrentParser, BLOCK_SIZE};
pub use tracker::{HttpTracker, PeerAddress, Tracker, TrackerSettings, UdpTracker};
