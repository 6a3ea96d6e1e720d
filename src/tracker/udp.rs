//! UDP tracker client
//!
//! Connect then announce over a single datagram socket, big-endian
//! throughout. Each phase is retried a fixed number of times with the same
//! transaction id; a reply that does not match is a protocol failure.

use std::collections::HashSet;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::{parse_compact_peers, PeerAddress, Tracker, TrackerSettings};
use crate::error::TorrentError;
use crate::torrent::TorrentDescriptor;

/// Magic connection id for the connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_RESPONSE_MIN_LEN: usize = 20;

/// Tracker reached over `udp://host:port`
pub struct UdpTracker {
    url: String,
    settings: TrackerSettings,
    socket: Option<UdpSocket>,
}

impl UdpTracker {
    pub fn new(url: impl Into<String>, settings: TrackerSettings) -> Self {
        Self {
            url: url.into(),
            settings,
            socket: None,
        }
    }

    /// Resolve the tracker host to an IPv4 socket address
    async fn resolve(&self) -> Result<SocketAddr> {
        let parsed = url::Url::parse(&self.url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TorrentError::tracker_protocol("Missing host", &self.url))?;
        let port = parsed
            .port()
            .ok_or_else(|| TorrentError::tracker_protocol("Missing port", &self.url))?;

        let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
            warn!("Failed to resolve {}: {}", self.url, e);
            TorrentError::network_error_full("Failed to resolve tracker", self.url.clone(), e.to_string())
        })?;
        addrs
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TorrentError::network_error_full("No IPv4 address for tracker", self.url.clone(), host.to_string()).into())
    }

    /// Bind and connect the socket on first use
    async fn socket(&mut self) -> Result<&UdpSocket> {
        if self.socket.is_none() {
            let addr = self.resolve().await?;
            let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
                error!("Failed to bind UDP socket: {}", e);
                TorrentError::network_error_full("Failed to bind UDP socket", "0.0.0.0:0", e.to_string())
            })?;
            socket.connect(addr).await.map_err(|e| {
                TorrentError::network_error_full("Failed to connect UDP socket", addr.to_string(), e.to_string())
            })?;
            debug!("UDP tracker {} resolved to {}", self.url, addr);
            self.socket = Some(socket);
        }
        self.socket
            .as_ref()
            .ok_or_else(|| TorrentError::network_error("UDP socket unavailable").into())
    }

    /// Send `request` and wait for a reply to `transaction_id`.
    ///
    /// Retries only on timeout. Any reply that arrives is validated and
    /// either accepted or turned into a protocol error.
    async fn exchange(&mut self, request: &[u8], action: u32, transaction_id: u32, min_len: usize) -> Result<Vec<u8>> {
        let url = self.url.clone();
        let settings = self.settings;
        let socket = self.socket().await?;
        let mut buf = vec![0u8; 2048];

        for attempt in 1..=settings.max_attempts {
            trace!("UDP {} action {} attempt {}/{}", url, action, attempt, settings.max_attempts);
            socket.send(request).await.map_err(|e| {
                TorrentError::network_error_full("Failed to send to tracker", url.clone(), e.to_string())
            })?;

            let len = match timeout(settings.timeout, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    return Err(TorrentError::network_error_full("Failed to receive from tracker", url, e.to_string()).into());
                }
                Err(_) => {
                    warn!("UDP tracker {} timed out (attempt {}/{})", url, attempt, settings.max_attempts);
                    continue;
                }
            };

            return Self::check_reply(&buf[..len], action, transaction_id, min_len, &url).map(|()| buf[..len].to_vec());
        }

        Err(TorrentError::tracker_timeout(
            format!("No reply after {} attempts", settings.max_attempts),
            url,
        )
        .into())
    }

    fn check_reply(reply: &[u8], action: u32, transaction_id: u32, min_len: usize, url: &str) -> Result<()> {
        if reply.len() < 8 {
            return Err(TorrentError::tracker_protocol(format!("Reply too short: {} bytes", reply.len()), url).into());
        }
        let mut header = &reply[..8];
        let reply_action = header.get_u32();
        let reply_txid = header.get_u32();

        if reply_txid != transaction_id {
            error!("UDP tracker {} transaction id mismatch: sent {:#x}, got {:#x}", url, transaction_id, reply_txid);
            return Err(TorrentError::tracker_protocol("Transaction id mismatch", url).into());
        }
        if reply_action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&reply[8..]).into_owned();
            return Err(TorrentError::tracker_protocol(format!("Tracker error: {}", message), url).into());
        }
        if reply_action != action {
            return Err(TorrentError::tracker_protocol(
                format!("Unexpected action {} (expected {})", reply_action, action),
                url,
            )
            .into());
        }
        if reply.len() < min_len {
            return Err(TorrentError::tracker_protocol(
                format!("Reply too short: {} bytes, need {}", reply.len(), min_len),
                url,
            )
            .into());
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<u64> {
        let transaction_id: u32 = rand::random();
        let mut request = BytesMut::with_capacity(16);
        request.put_u64(PROTOCOL_ID);
        request.put_u32(ACTION_CONNECT);
        request.put_u32(transaction_id);

        let reply = self.exchange(&request, ACTION_CONNECT, transaction_id, CONNECT_RESPONSE_LEN).await?;
        let mut body = &reply[8..];
        let connection_id = body.get_u64();
        debug!("UDP tracker {} connection id {:#x}", self.url, connection_id);
        Ok(connection_id)
    }

    fn announce_request(&self, connection_id: u64, transaction_id: u32, descriptor: &TorrentDescriptor) -> BytesMut {
        let mut request = BytesMut::with_capacity(98);
        request.put_u64(connection_id);
        request.put_u32(ACTION_ANNOUNCE);
        request.put_u32(transaction_id);
        request.put_slice(&descriptor.info_hash);
        request.put_slice(&descriptor.peer_id);
        request.put_u64(0); // downloaded
        request.put_u64(descriptor.total_length()); // left
        request.put_u64(0); // uploaded
        request.put_u32(0); // event: none
        request.put_u32(0); // ip: sender's
        request.put_u32(rand::random()); // key
        request.put_i32(-1); // num_want: default
        request.put_u16(self.settings.listen_port);
        request
    }
}

#[async_trait]
impl Tracker for UdpTracker {
    async fn announce(&mut self, descriptor: &TorrentDescriptor) -> Result<HashSet<PeerAddress>> {
        info!("Announcing to UDP tracker {}", self.url);
        let connection_id = self.connect().await?;

        let transaction_id: u32 = rand::random();
        let request = self.announce_request(connection_id, transaction_id, descriptor);
        let reply = self
            .exchange(&request, ACTION_ANNOUNCE, transaction_id, ANNOUNCE_RESPONSE_MIN_LEN)
            .await?;

        let mut body = &reply[8..20];
        let interval = body.get_u32();
        let leechers = body.get_u32();
        let seeders = body.get_u32();
        let peers = parse_compact_peers(&reply[20..], &self.url)?;
        info!(
            "UDP tracker {} returned {} peers (interval {}s, {} seeders, {} leechers)",
            self.url,
            peers.len(),
            interval,
            seeders,
            leechers
        );
        Ok(peers.into_iter().collect())
    }

    async fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            debug!("Closed UDP socket for {}", self.url);
        }
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileEntry, TorrentDescriptor};
    use std::time::Duration;

    fn descriptor() -> TorrentDescriptor {
        TorrentDescriptor {
            name: "x".to_string(),
            info_hash: [0xab; 20],
            piece_length: 16384,
            pieces: vec![[0u8; 20]; 2],
            multi_file: false,
            files: vec![FileEntry { path: vec!["x".to_string()], length: 20000 }],
            announce_list: Vec::new(),
            peer_id: *b"-LC0001-abcdefghijkl",
        }
    }

    fn settings() -> TrackerSettings {
        TrackerSettings {
            listen_port: 6881,
            timeout: Duration::from_millis(200),
            max_attempts: 3,
        }
    }

    fn error_kind(err: &anyhow::Error) -> Option<&TorrentError> {
        err.downcast_ref::<TorrentError>()
    }

    async fn fake_tracker() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", socket.local_addr().unwrap());
        (socket, url)
    }

    #[tokio::test]
    async fn test_connect_and_announce() {
        let (server, url) = fake_tracker().await;
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];

            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            let mut req = &buf[..16];
            assert_eq!(req.get_u64(), PROTOCOL_ID);
            assert_eq!(req.get_u32(), ACTION_CONNECT);
            let txid = req.get_u32();
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_CONNECT);
            reply.put_u32(txid);
            reply.put_u64(0x1122334455667788);
            server.send_to(&reply, from).await.unwrap();

            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            let mut req = &buf[..98];
            assert_eq!(req.get_u64(), 0x1122334455667788);
            assert_eq!(req.get_u32(), ACTION_ANNOUNCE);
            let txid = req.get_u32();
            assert_eq!(&buf[16..36], &[0xab; 20]);
            let mut tail = &buf[56..98];
            assert_eq!(tail.get_u64(), 0);
            assert_eq!(tail.get_u64(), 20000);
            assert_eq!(tail.get_u64(), 0);
            tail.advance(12);
            assert_eq!(tail.get_i32(), -1);
            assert_eq!(tail.get_u16(), 6881);

            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ANNOUNCE);
            reply.put_u32(txid);
            reply.put_u32(1800);
            reply.put_u32(3);
            reply.put_u32(7);
            reply.put_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]);
            server.send_to(&reply, from).await.unwrap();
        });

        let mut tracker = UdpTracker::new(url, settings());
        let peers = tracker.announce(&descriptor()).await.unwrap();
        server_task.await.unwrap();

        let mut peers: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        peers.sort();
        assert_eq!(peers, vec!["10.0.0.1:6881".to_string(), "10.0.0.2:6882".to_string()]);
        tracker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_transaction_id_stops_before_announce() {
        let (server, url) = fake_tracker().await;
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut req = &buf[12..16];
            let txid = req.get_u32();
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_CONNECT);
            reply.put_u32(txid.wrapping_add(1));
            reply.put_u64(42);
            server.send_to(&reply, from).await.unwrap();

            // nothing else may arrive
            let next = timeout(Duration::from_millis(300), server.recv_from(&mut buf)).await;
            assert!(next.is_err(), "announce phase must not start");
        });

        let mut tracker = UdpTracker::new(url, settings());
        let err = tracker.announce(&descriptor()).await.unwrap_err();
        assert!(matches!(error_kind(&err), Some(TorrentError::TrackerProtocol { .. })));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_after_retries_with_same_transaction_id() {
        let (server, url) = fake_tracker().await;
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut txids = Vec::new();
            for _ in 0..3 {
                let (len, _) = server.recv_from(&mut buf).await.unwrap();
                assert_eq!(len, 16);
                txids.push(buf[12..16].to_vec());
            }
            txids
        });

        let mut tracker = UdpTracker::new(url, settings());
        let err = tracker.announce(&descriptor()).await.unwrap_err();
        assert!(matches!(error_kind(&err), Some(TorrentError::TrackerTimeout { .. })));

        let txids = server_task.await.unwrap();
        assert!(txids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_error_action_surfaces_message() {
        let (server, url) = fake_tracker().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ERROR);
            reply.put_slice(&buf[12..16]);
            reply.put_slice(b"torrent not registered");
            server.send_to(&reply, from).await.unwrap();
        });

        let mut tracker = UdpTracker::new(url, settings());
        let err = tracker.announce(&descriptor()).await.unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
        assert!(matches!(error_kind(&err), Some(TorrentError::TrackerProtocol { .. })));
    }

    #[tokio::test]
    async fn test_short_connect_reply_is_protocol_error() {
        let (server, url) = fake_tracker().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_CONNECT);
            reply.put_slice(&buf[12..16]);
            reply.put_u32(1);
            server.send_to(&reply, from).await.unwrap();
        });

        let mut tracker = UdpTracker::new(url, settings());
        let err = tracker.announce(&descriptor()).await.unwrap_err();
        assert!(matches!(error_kind(&err), Some(TorrentError::TrackerProtocol { .. })));
    }
}
