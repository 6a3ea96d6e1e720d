//! HTTP tracker client

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{parse_compact_peers, PeerAddress, Tracker, TrackerSettings};
use crate::bencode::{self, BencodeValue};
use crate::error::TorrentError;
use crate::torrent::TorrentDescriptor;

/// Tracker reached over `http://` or `https://`
pub struct HttpTracker {
    url: String,
    settings: TrackerSettings,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: impl Into<String>, settings: TrackerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| TorrentError::network_error_full("Failed to build HTTP client", "tracker", e.to_string()))?;
        Ok(Self {
            url: url.into(),
            settings,
            client,
        })
    }

    /// Announce URL with the query string appended
    pub fn announce_url(&self, descriptor: &TorrentDescriptor) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=0&compact=1",
            self.url,
            separator,
            urlencoding::encode_binary(&descriptor.info_hash),
            urlencoding::encode_binary(&descriptor.peer_id),
            self.settings.listen_port,
        )
    }

    /// Extract peers from a decoded tracker response
    fn parse_response(&self, body: &[u8]) -> Result<Vec<PeerAddress>> {
        let response = bencode::parse(body)
            .map_err(|e| TorrentError::tracker_protocol(format!("Malformed response: {}", e), &self.url))?;

        if let Some(reason) = response.get(b"failure reason") {
            let reason = reason.as_bytes().map(String::from_utf8_lossy).unwrap_or_default();
            warn!("Tracker {} refused announce: {}", self.url, reason);
            return Err(TorrentError::tracker_protocol(format!("Tracker failure: {}", reason), &self.url).into());
        }

        match response.get(b"interval").and_then(BencodeValue::as_int) {
            Some(interval) => debug!("Tracker {} interval {}s", self.url, interval),
            None => debug!("Tracker {} sent no interval", self.url),
        }

        match response.get(b"peers") {
            Some(BencodeValue::Bytes(compact)) => parse_compact_peers(compact, &self.url),
            Some(BencodeValue::List(entries)) => Ok(entries.iter().filter_map(Self::dictionary_peer).collect()),
            Some(other) => Err(TorrentError::tracker_protocol(
                format!("Unexpected peers value of type {}", other.kind()),
                &self.url,
            )
            .into()),
            None => Err(TorrentError::tracker_protocol("Response has no peers", &self.url).into()),
        }
    }

    /// Non-compact `{ip, port}` entry; IPv6 and hostnames are skipped
    fn dictionary_peer(entry: &BencodeValue) -> Option<PeerAddress> {
        let ip: Ipv4Addr = entry.get(b"ip")?.as_str()?.parse().ok()?;
        let port = u16::try_from(entry.get(b"port")?.as_int()?).ok()?;
        (port != 0).then(|| PeerAddress::new(SocketAddrV4::new(ip, port)))
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&mut self, descriptor: &TorrentDescriptor) -> Result<HashSet<PeerAddress>> {
        info!("Announcing to HTTP tracker {}", self.url);
        let url = self.announce_url(descriptor);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TorrentError::tracker_timeout(e.to_string(), &self.url)
            } else {
                TorrentError::network_error_full("Tracker request failed", self.url.clone(), e.to_string())
            }
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            warn!("Tracker {} answered with status {}", self.url, status);
            return Err(TorrentError::tracker_protocol_with_status(
                format!("Unexpected status {}", status),
                &self.url,
                status.as_u16(),
            )
            .into());
        }

        let body = response.bytes().await.map_err(|e| {
            TorrentError::network_error_full("Failed to read tracker response", self.url.clone(), e.to_string())
        })?;

        let peers = self.parse_response(&body)?;
        info!("HTTP tracker {} returned {} peers", self.url, peers.len());
        Ok(peers.into_iter().collect())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}
