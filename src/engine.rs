//! Download engine
//!
//! Wires trackers, peer connections, the piece scheduler and the disk
//! writer together and runs them until the torrent is on disk or the
//! caller asks to stop.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cli::{DownloadStats, ProgressDisplay};
use crate::error::TorrentError;
use crate::peer::{ConnectionSettings, PeerManager};
use crate::scheduler::{PieceScheduler, SchedulerStats};
use crate::storage::{prepare_files, DiskWriter, FileLayout, WriterEvent, WriterReport};
use crate::torrent::TorrentDescriptor;
use crate::tracker::{build_trackers, spawn_announces, AnnounceOutcome, PeerAddress, Tracker, TrackerSettings};

/// Plain settings for one download run
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Directory the torrent's files are created under
    pub output_dir: PathBuf,
    pub connection: ConnectionSettings,
    pub tracker: TrackerSettings,
    /// Concurrent peer connections
    pub max_connections: usize,
    /// Time between announce rounds while below `max_connections`
    pub reannounce_interval: Duration,
    /// Time between progress refreshes
    pub progress_interval: Duration,
    /// Verified pieces buffered between connections and the writer
    pub channel_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            connection: ConnectionSettings::default(),
            tracker: TrackerSettings::default(),
            max_connections: 50,
            reannounce_interval: Duration::from_secs(120),
            progress_interval: Duration::from_secs(1),
            channel_capacity: 16,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Every piece verified and persisted
    Complete,
    /// Stopped by the shutdown signal
    Interrupted,
}

/// Summary returned when a run ends without a fatal error
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub status: DownloadStatus,
    /// Distinct pieces the writer acknowledged
    pub pieces_persisted: usize,
    pub scheduler: SchedulerStats,
    pub writer: WriterReport,
}

/// Orchestrates one torrent download
pub struct Engine {
    descriptor: Arc<TorrentDescriptor>,
    settings: EngineSettings,
    trackers: Vec<Box<dyn Tracker>>,
    initial_peers: Vec<PeerAddress>,
}

impl Engine {
    /// Build an engine with a tracker for every supported announce URL
    pub fn new(descriptor: Arc<TorrentDescriptor>, settings: EngineSettings) -> Self {
        let trackers = build_trackers(&descriptor.announce_list, settings.tracker);
        Self::with_trackers(descriptor, settings, trackers)
    }

    pub fn with_trackers(
        descriptor: Arc<TorrentDescriptor>,
        settings: EngineSettings,
        trackers: Vec<Box<dyn Tracker>>,
    ) -> Self {
        Self {
            descriptor,
            settings,
            trackers,
            initial_peers: Vec::new(),
        }
    }

    /// Peers to connect to before any tracker answers
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        self.initial_peers.extend(peers);
        self
    }

    /// Download until complete, until `shutdown` resolves, or until the writer fails.
    ///
    /// Peer and tracker failures are contained; only storage failures end
    /// the run with an error.
    pub async fn run<F>(mut self, progress: &mut ProgressDisplay, shutdown: F) -> Result<EngineReport>
    where
        F: Future<Output = ()>,
    {
        let descriptor = self.descriptor.clone();
        let piece_count = descriptor.piece_count();
        info!(
            "Starting download of {} ({} pieces, {} bytes)",
            descriptor.name,
            piece_count,
            descriptor.total_length()
        );

        let layout = FileLayout::from_descriptor(&self.settings.output_dir, &descriptor);
        prepare_files(&layout).await?;

        let (pieces_tx, pieces_rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(DiskWriter::new(layout, events_tx).run(pieces_rx));

        let scheduler = Arc::new(PieceScheduler::new(descriptor.clone()));
        let mut peers = PeerManager::new(
            scheduler.clone(),
            pieces_tx,
            self.settings.connection,
            self.settings.max_connections,
        );

        if self.trackers.is_empty() && self.initial_peers.is_empty() {
            warn!("No usable trackers and no peers given; nothing to download from");
        }
        let initial = std::mem::take(&mut self.initial_peers);
        if !initial.is_empty() {
            peers.add_peers(initial);
        }

        let mut announces: JoinSet<AnnounceOutcome> = JoinSet::new();
        let mut announce_timer = interval(self.settings.reannounce_interval);
        announce_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress_timer = interval(self.settings.progress_interval);
        progress_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut persisted: HashSet<u32> = HashSet::new();
        let mut failure: Option<TorrentError> = None;
        tokio::pin!(shutdown);

        let status = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping peers");
                    break DownloadStatus::Interrupted;
                }
                event = events_rx.recv() => match event {
                    Some(WriterEvent::Persisted(index)) => {
                        persisted.insert(index);
                        if persisted.len() == piece_count {
                            info!("All pieces persisted");
                            break DownloadStatus::Complete;
                        }
                    }
                    Some(WriterEvent::Failed { path, error }) => {
                        error!("Disk write to {} failed: {}", path.display(), error);
                        failure = Some(TorrentError::storage_error_full("Write failed", path.display().to_string(), error));
                        break DownloadStatus::Interrupted;
                    }
                    Some(WriterEvent::Rejected { piece_index, error }) => {
                        error!("Disk writer dropped piece {}: {}", piece_index, error);
                        failure = Some(TorrentError::storage_error_full(
                            format!("Piece {} could not be written", piece_index),
                            self.settings.output_dir.display().to_string(),
                            error,
                        ));
                        break DownloadStatus::Interrupted;
                    }
                    None => {
                        failure = Some(TorrentError::storage_error("Disk writer stopped unexpectedly"));
                        break DownloadStatus::Interrupted;
                    }
                },
                _ = announce_timer.tick() => {
                    if announces.is_empty() && !self.trackers.is_empty() && peers.has_capacity() {
                        spawn_announces(self.trackers.drain(..), &descriptor, &mut announces);
                    }
                }
                Some(joined) = announces.join_next(), if !announces.is_empty() => match joined {
                    Ok(AnnounceOutcome { tracker, peers: found }) => {
                        let added = peers.add_peers(found);
                        info!(
                            "{} new peers from {}, {} connected, {} queued",
                            added,
                            tracker.url(),
                            peers.connection_count(),
                            peers.pending_count()
                        );
                        self.trackers.push(tracker);
                    }
                    Err(e) => error!("Announce task failed, dropping its tracker: {}", e),
                },
                Some(_) = peers.join_next(), if peers.connection_count() > 0 => {
                    if peers.connection_count() == 0 && peers.pending_count() == 0 {
                        debug!("No peers connected; waiting for the next announce");
                    }
                }
                _ = progress_timer.tick() => {
                    let stats = scheduler.stats().await;
                    let line = Self::display_stats(&stats, descriptor.total_length(), peers.connection_count(), progress);
                    if let Err(e) = progress.update(&line) {
                        debug!("Progress output failed: {}", e);
                    }
                }
            }
        };

        peers.shutdown().await;
        announces.abort_all();
        drop(peers);

        let writer_report = writer
            .await
            .map_err(|e| TorrentError::storage_error(format!("Disk writer task failed: {}", e)))?;
        while let Ok(event) = events_rx.try_recv() {
            if let WriterEvent::Persisted(index) = event {
                persisted.insert(index);
            }
        }

        if let Some(err) = failure {
            return Err(err.into());
        }

        let stats = scheduler.stats().await;
        let status = if persisted.len() == piece_count { DownloadStatus::Complete } else { status };
        if status == DownloadStatus::Complete {
            let line = Self::display_stats(&stats, descriptor.total_length(), 0, progress);
            if let Err(e) = progress.print_complete(&line) {
                debug!("Progress output failed: {}", e);
            }
        }
        info!(
            "Download {:?}: {}/{} pieces on disk, {} hash failures",
            status,
            persisted.len(),
            piece_count,
            stats.hash_failures
        );

        Ok(EngineReport {
            status,
            pieces_persisted: persisted.len(),
            scheduler: stats,
            writer: writer_report,
        })
    }

    fn display_stats(stats: &SchedulerStats, total: u64, peers: usize, progress: &mut ProgressDisplay) -> DownloadStats {
        DownloadStats {
            downloaded: stats.bytes_complete,
            total,
            pieces_complete: stats.pieces_complete,
            pieces_total: stats.pieces_total,
            download_speed: progress.sample_speed(stats.bytes_complete),
            peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BitTorrentWire, Bitfield, Handshake, Message, WireProtocol};
    use crate::torrent::FileEntry;
    use async_trait::async_trait;
    use sha1::{Digest, Sha1};
    use std::net::SocketAddrV4;
    use tokio::net::TcpListener;

    struct StaticTracker {
        peers: Vec<PeerAddress>,
    }

    #[async_trait]
    impl Tracker for StaticTracker {
        async fn announce(&mut self, _descriptor: &TorrentDescriptor) -> Result<HashSet<PeerAddress>> {
            Ok(self.peers.iter().copied().collect())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn url(&self) -> &str {
            "static://"
        }
    }

    /// Never answers in time
    struct DeadTracker {
        stall: Duration,
    }

    #[async_trait]
    impl Tracker for DeadTracker {
        async fn announce(&mut self, _descriptor: &TorrentDescriptor) -> Result<HashSet<PeerAddress>> {
            tokio::time::sleep(self.stall).await;
            Err(TorrentError::tracker_timeout("No reply after 3 attempts", "udp://dead.example:80").into())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn url(&self) -> &str {
            "udp://dead.example:80"
        }
    }

    fn descriptor(content: &[u8], piece_length: u32) -> Arc<TorrentDescriptor> {
        Arc::new(TorrentDescriptor {
            name: "movie.mkv".to_string(),
            info_hash: [0x42; 20],
            piece_length,
            pieces: content
                .chunks(piece_length as usize)
                .map(|chunk| Sha1::digest(chunk).into())
                .collect(),
            multi_file: false,
            files: vec![FileEntry { path: vec!["movie.mkv".to_string()], length: content.len() as u64 }],
            announce_list: Vec::new(),
            peer_id: [0x11; 20],
        })
    }

    /// Serve `content` to every connection that asks for it
    async fn seed(listener: TcpListener, desc: Arc<TorrentDescriptor>, content: Vec<u8>) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let desc = desc.clone();
            let content = content.clone();
            tokio::spawn(async move {
                let mut wire = BitTorrentWire::for_torrent(desc.bitfield_len());
                if wire.read_handshake(&mut stream).await.is_err() {
                    return;
                }
                let reply = Handshake::new(desc.info_hash, [0x22; 20]);
                wire.write_handshake(&mut stream, &reply).await.unwrap();
                let mut have = Bitfield::new(desc.piece_count());
                (0..desc.piece_count()).for_each(|i| {
                    have.set(i);
                });
                wire.write_message(&mut stream, &Message::Bitfield { bitfield: have.as_bytes().to_vec() })
                    .await
                    .unwrap();

                while let Ok(message) = wire.read_message(&mut stream).await {
                    match message {
                        Message::Interested => {
                            let _ = wire.write_message(&mut stream, &Message::Unchoke).await;
                        }
                        Message::Request { index, begin, length } => {
                            let start = desc.piece_offset(index) as usize + begin as usize;
                            let block = content[start..start + length as usize].to_vec();
                            if wire.write_message(&mut stream, &Message::Piece { index, begin, block }).await.is_err() {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    }

    fn settings(dir: &std::path::Path) -> EngineSettings {
        EngineSettings {
            output_dir: dir.to_path_buf(),
            progress_interval: Duration::from_millis(50),
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_downloads_through_tracker_announce() {
        let content: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let desc = descriptor(&content, 32 * 1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(seed(listener, desc.clone(), content.clone()));

        let dir = tempfile::tempdir().unwrap();
        let tracker = StaticTracker { peers: vec![PeerAddress::new(SocketAddrV4::new([127, 0, 0, 1].into(), port))] };
        let engine = Engine::with_trackers(desc.clone(), settings(dir.path()), vec![Box::new(tracker)]);

        let mut progress = ProgressDisplay::new(true);
        let report = tokio::time::timeout(
            Duration::from_secs(20),
            engine.run(&mut progress, std::future::pending::<()>()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(report.status, DownloadStatus::Complete);
        assert_eq!(report.pieces_persisted, desc.piece_count());
        assert_eq!(report.writer.bytes_written, content.len() as u64);
        assert!(report.writer.failed_files.is_empty());
        assert_eq!(std::fs::read(dir.path().join("movie.mkv")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_dead_tracker_does_not_hold_back_peers() {
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 199) as u8).collect();
        let desc = descriptor(&content, 32 * 1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(seed(listener, desc.clone(), content.clone()));

        let dir = tempfile::tempdir().unwrap();
        let trackers: Vec<Box<dyn Tracker>> = vec![
            Box::new(DeadTracker { stall: Duration::from_secs(30) }),
            Box::new(StaticTracker { peers: vec![PeerAddress::new(SocketAddrV4::new([127, 0, 0, 1].into(), port))] }),
        ];
        let engine = Engine::with_trackers(desc.clone(), settings(dir.path()), trackers);

        let mut progress = ProgressDisplay::new(true);
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            engine.run(&mut progress, std::future::pending::<()>()),
        )
        .await
        .expect("download waited on the dead tracker")
        .unwrap();

        assert_eq!(report.status, DownloadStatus::Complete);
        assert_eq!(std::fs::read(dir.path().join("movie.mkv")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_and_keeps_files() {
        let content = vec![1u8; 5000];
        let desc = descriptor(&content, 1024);
        let dir = tempfile::tempdir().unwrap();

        let engine = Engine::new(desc, settings(dir.path()));
        let mut progress = ProgressDisplay::new(true);
        let report = engine
            .run(&mut progress, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(report.status, DownloadStatus::Interrupted);
        assert_eq!(report.pieces_persisted, 0);
        assert_eq!(std::fs::metadata(dir.path().join("movie.mkv")).unwrap().len(), 5000);
    }

    #[tokio::test]
    async fn test_unreachable_peers_do_not_end_the_run() {
        let content = vec![9u8; 2048];
        let desc = descriptor(&content, 1024);
        let dir = tempfile::tempdir().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = Engine::new(desc, settings(dir.path()))
            .with_peers([PeerAddress::new(SocketAddrV4::new([127, 0, 0, 1].into(), port))]);
        let mut progress = ProgressDisplay::new(true);
        let report = engine
            .run(&mut progress, tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(report.status, DownloadStatus::Interrupted);
        assert_eq!(report.scheduler.pieces_complete, 0);
    }

    #[tokio::test]
    async fn test_unwritable_output_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let desc = Arc::new(TorrentDescriptor { multi_file: true, ..(*descriptor(b"abcd", 4)).clone() });
        let engine = Engine::new(desc, settings(&blocker));
        let mut progress = ProgressDisplay::new(true);
        let err = engine.run(&mut progress, std::future::pending::<()>()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::StorageError { .. })));
    }
}
