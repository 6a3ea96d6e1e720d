//! Tracker client module
//!
//! UDP and HTTP trackers behind one announce contract.

pub mod announce;
pub mod compact;
pub mod http;
pub mod udp;

use std::collections::HashSet;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::error::TorrentError;
use crate::torrent::TorrentDescriptor;

pub use announce::{announce_one, build_trackers, spawn_announces, AnnounceOutcome};
pub use compact::{encode_compact_peers, parse_compact_peers};
pub use http::HttpTracker;
pub use udp::UdpTracker;

/// A peer reported by a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress(SocketAddrV4);

impl PeerAddress {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.0
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-announce settings shared by every tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Port we report to trackers
    pub listen_port: u16,
    /// Deadline for one UDP attempt or one HTTP request
    pub timeout: Duration,
    /// UDP attempts per phase before giving up
    pub max_attempts: u32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// One tracker endpoint
#[async_trait]
pub trait Tracker: Send {
    /// Announce the torrent and return the peers the tracker reported
    async fn announce(&mut self, descriptor: &TorrentDescriptor) -> Result<HashSet<PeerAddress>>;

    /// Release any sockets held by the tracker
    async fn close(&mut self) -> Result<()>;

    /// Announce URL of this tracker
    fn url(&self) -> &str;
}

/// Build a tracker for an announce URL based on its scheme
pub fn from_url(url: &str, settings: TrackerSettings) -> Result<Box<dyn Tracker>> {
    let parsed = url::Url::parse(url)?;
    match parsed.scheme() {
        "udp" => Ok(Box::new(UdpTracker::new(url, settings))),
        "http" | "https" => Ok(Box::new(HttpTracker::new(url, settings)?)),
        other => {
            warn!("Unsupported tracker scheme '{}' in {}", other, url);
            Err(TorrentError::config_error_with_field(
                format!("Unsupported tracker scheme '{}'", other),
                "announce",
            )
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_peer_address_dedup() {
        let a = PeerAddress::new(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881));
        let b = PeerAddress::new(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881));
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(a.to_string(), "1.2.3.4:6881");
    }

    #[test]
    fn test_from_url_dispatch() {
        let settings = TrackerSettings::default();
        assert_eq!(from_url("udp://tracker.example:6969/announce", settings).unwrap().url(), "udp://tracker.example:6969/announce");
        assert_eq!(from_url("http://tracker.example/announce", settings).unwrap().url(), "http://tracker.example/announce");
        assert!(from_url("wss://tracker.example/announce", settings).is_err());
        assert!(from_url("not a url", settings).is_err());
    }
}
