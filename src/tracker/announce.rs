//! Concurrent announce across all trackers

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{from_url, PeerAddress, Tracker, TrackerSettings};
use crate::torrent::TorrentDescriptor;

/// Build a tracker for every URL with a supported scheme
pub fn build_trackers(urls: &[String], settings: TrackerSettings) -> Vec<Box<dyn Tracker>> {
    urls.iter()
        .filter_map(|url| match from_url(url, settings) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                warn!("Skipping tracker {}: {}", url, e);
                None
            }
        })
        .collect()
}

/// One tracker's announce result, with the tracker handed back for the next round
pub struct AnnounceOutcome {
    pub tracker: Box<dyn Tracker>,
    /// Empty when the announce failed
    pub peers: HashSet<PeerAddress>,
}

/// Announce to a single tracker. Failures are logged and yield no peers.
pub async fn announce_one(mut tracker: Box<dyn Tracker>, descriptor: Arc<TorrentDescriptor>) -> AnnounceOutcome {
    let peers = match tracker.announce(&descriptor).await {
        Ok(peers) => {
            debug!("Tracker {} contributed {} peers", tracker.url(), peers.len());
            peers
        }
        Err(e) => {
            warn!("Announce to {} failed: {}", tracker.url(), e);
            HashSet::new()
        }
    };
    if let Err(e) = tracker.close().await {
        debug!("Closing tracker {} failed: {}", tracker.url(), e);
    }
    AnnounceOutcome { tracker, peers }
}

/// Start one announce task per tracker on `tasks`.
///
/// Each outcome is joined on its own, so a slow or dead tracker never holds
/// back the peers of the others.
pub fn spawn_announces(
    trackers: impl IntoIterator<Item = Box<dyn Tracker>>,
    descriptor: &Arc<TorrentDescriptor>,
    tasks: &mut JoinSet<AnnounceOutcome>,
) -> usize {
    let mut started = 0;
    for tracker in trackers {
        tasks.spawn(announce_one(tracker, Arc::clone(descriptor)));
        started += 1;
    }
    info!("Announcing to {} trackers", started);
    started
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TorrentError;
    use crate::torrent::FileEntry;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    struct StaticTracker {
        url: String,
        peers: Vec<PeerAddress>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl Tracker for StaticTracker {
        async fn announce(&mut self, _descriptor: &TorrentDescriptor) -> Result<HashSet<PeerAddress>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(TorrentError::tracker_timeout("no reply", &self.url).into());
            }
            Ok(self.peers.iter().copied().collect())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn url(&self) -> &str {
            &self.url
        }
    }

    fn peer(last: u8) -> PeerAddress {
        PeerAddress::new(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 6881))
    }

    fn descriptor() -> Arc<TorrentDescriptor> {
        Arc::new(TorrentDescriptor {
            name: "x".to_string(),
            info_hash: [0u8; 20],
            piece_length: 16,
            pieces: vec![[0u8; 20]],
            multi_file: false,
            files: vec![FileEntry { path: vec!["x".to_string()], length: 16 }],
            announce_list: Vec::new(),
            peer_id: [0u8; 20],
        })
    }

    fn tracker(url: &str, peers: Vec<PeerAddress>, fail: bool, delay: Duration) -> Box<dyn Tracker> {
        Box::new(StaticTracker { url: url.to_string(), peers, fail, delay })
    }

    #[tokio::test]
    async fn test_outcomes_hand_trackers_back() {
        let mut tasks = JoinSet::new();
        let trackers = vec![
            tracker("a", vec![peer(1), peer(2)], false, Duration::ZERO),
            tracker("b", vec![peer(2), peer(3)], false, Duration::from_millis(20)),
        ];
        assert_eq!(spawn_announces(trackers, &descriptor(), &mut tasks), 2);

        let mut merged = HashSet::new();
        let mut urls = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap();
            urls.push(outcome.tracker.url().to_string());
            merged.extend(outcome.peers);
        }
        urls.sort();
        assert_eq!(urls, vec!["a", "b"]);
        assert_eq!(merged.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_tracker_yields_no_peers() {
        let outcome = announce_one(tracker("bad", vec![peer(4)], true, Duration::ZERO), descriptor()).await;
        assert!(outcome.peers.is_empty());
        assert_eq!(outcome.tracker.url(), "bad");
    }

    #[tokio::test]
    async fn test_slow_failing_tracker_does_not_delay_others() {
        let mut tasks = JoinSet::new();
        let trackers = vec![
            tracker("dead", vec![], true, Duration::from_secs(2)),
            tracker("good", vec![peer(9)], false, Duration::ZERO),
        ];
        spawn_announces(trackers, &descriptor(), &mut tasks);

        let first = tokio::time::timeout(Duration::from_millis(500), tasks.join_next())
            .await
            .expect("fast tracker held back")
            .unwrap()
            .unwrap();
        assert_eq!(first.tracker.url(), "good");
        assert_eq!(first.peers.into_iter().collect::<Vec<_>>(), vec![peer(9)]);
        tasks.abort_all();
    }

    #[test]
    fn test_build_trackers_skips_unsupported() {
        let urls = vec![
            "udp://tracker.example:80".to_string(),
            "wss://tracker.example".to_string(),
            "http://tracker.example/announce".to_string(),
        ];
        let trackers = build_trackers(&urls, TrackerSettings::default());
        assert_eq!(trackers.len(), 2);
    }
}
