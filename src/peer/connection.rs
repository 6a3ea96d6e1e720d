//! Peer connection module
//!
//! One TCP session with one remote peer: handshake, then a message loop
//! that pulls work from the scheduler and hands verified pieces to the
//! disk writer.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::{ConnectionState, Peer};
use crate::protocol::{BitTorrentWire, Bitfield, Handshake, Message, WireProtocol};
use crate::scheduler::{BlockRequest, ConnectionId, PieceScheduler};
use crate::storage::PieceMessage;
use crate::torrent::TorrentDescriptor;

/// Timeouts and pipelining for a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Deadline for the TCP connect and for the handshake reply
    pub connect_timeout: Duration,
    /// Deadline for each individual message read
    pub read_timeout: Duration,
    /// Maximum outstanding block requests
    pub pipeline_depth: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            pipeline_depth: 5,
        }
    }
}

/// An established, handshaken peer connection
pub struct PeerConnection {
    id: ConnectionId,
    /// Peer flags and outstanding requests
    pub peer: Peer,
    stream: TcpStream,
    wire: BitTorrentWire,
    settings: ConnectionSettings,
    /// Peer has sent a bitfield or a have
    advertised: bool,
}

impl PeerConnection {
    /// Connect to `addr` and exchange handshakes for `descriptor`
    pub async fn connect(
        id: ConnectionId,
        addr: SocketAddr,
        descriptor: &TorrentDescriptor,
        settings: ConnectionSettings,
    ) -> Result<Self> {
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("Connection timeout to {}", addr);
                TorrentError::handshake_error_full("Connection timeout", addr.to_string(), format!("{:?}", settings.connect_timeout))
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        let mut connection = Self {
            id,
            peer: Peer::new(addr),
            stream,
            wire: BitTorrentWire::for_torrent(descriptor.bitfield_len()),
            settings,
            advertised: false,
        };
        connection.peer.set_state(ConnectionState::Handshaking);
        connection.perform_handshake(descriptor.info_hash, descriptor.peer_id).await?;

        info!("Connected to peer {} (connection {})", addr, id);
        Ok(connection)
    }

    async fn perform_handshake(&mut self, info_hash: [u8; 20], our_peer_id: [u8; 20]) -> Result<()> {
        let addr = self.peer.addr;
        let ours = Handshake::new(info_hash, our_peer_id);

        self.wire.write_handshake(&mut self.stream, &ours).await.map_err(|e| {
            TorrentError::handshake_error_full("Failed to send handshake", addr.to_string(), e.to_string())
        })?;

        let theirs = timeout(self.settings.connect_timeout, self.wire.read_handshake(&mut self.stream))
            .await
            .map_err(|_| TorrentError::handshake_error("Handshake reply timed out", addr.to_string()))?
            .map_err(|e| {
                TorrentError::handshake_error_full("Failed to read handshake", addr.to_string(), e.to_string())
            })?;

        if !theirs.validate(&info_hash) {
            warn!("Peer {} answered with a different info hash", addr);
            return Err(TorrentError::handshake_error_full(
                "Info hash mismatch",
                addr.to_string(),
                hex::encode(theirs.info_hash),
            )
            .into());
        }

        self.peer.set_peer_id(theirs.peer_id);
        self.peer.set_state(ConnectionState::Idle);
        trace!("Handshake with {} complete, remote id {:?}", addr, self.peer.peer_id_hex());
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.addr
    }

    /// Drive the connection until the torrent completes or the peer fails.
    ///
    /// The connection always leaves the scheduler on exit, which returns
    /// its outstanding blocks to the pool.
    pub async fn run(mut self, scheduler: Arc<PieceScheduler>, pieces_tx: mpsc::Sender<PieceMessage>) -> Result<()> {
        let result = self.message_loop(&scheduler, &pieces_tx).await;
        self.peer.set_state(ConnectionState::Closed);
        self.peer.outstanding.clear();
        scheduler.remove_connection(self.id).await;
        match &result {
            Ok(()) => debug!("Connection to {} finished", self.peer.addr),
            Err(e) => debug!("Connection to {} closed: {}", self.peer.addr, e),
        }
        result
    }

    async fn message_loop(&mut self, scheduler: &PieceScheduler, pieces_tx: &mpsc::Sender<PieceMessage>) -> Result<()> {
        self.send_message(&Message::Interested).await?;
        self.peer.am_interested = true;
        self.peer.set_state(ConnectionState::Active);

        loop {
            if self.peer.outstanding.is_empty() {
                if scheduler.is_complete().await {
                    return Ok(());
                }
                if self.advertised && !scheduler.is_interesting(self.id).await {
                    debug!("Peer {} has nothing we still need", self.peer.addr);
                    self.send_message(&Message::NotInterested).await?;
                    self.peer.am_interested = false;
                    return Ok(());
                }
            }
            let message = self.receive_message().await?;
            self.handle_message(message, scheduler, pieces_tx).await?;
        }
    }

    async fn handle_message(
        &mut self,
        message: Message,
        scheduler: &PieceScheduler,
        pieces_tx: &mpsc::Sender<PieceMessage>,
    ) -> Result<()> {
        match message {
            Message::KeepAlive => trace!("KeepAlive from {}", self.peer.addr),
            Message::Choke => {
                debug!("Choked by {}", self.peer.addr);
                self.peer.peer_choking = true;
                self.peer.outstanding.clear();
                scheduler.release_requests(self.id).await;
            }
            Message::Unchoke => {
                debug!("Unchoked by {}", self.peer.addr);
                self.peer.peer_choking = false;
                self.fill_pipeline(scheduler).await?;
            }
            Message::Interested => {
                self.peer.peer_interested = true;
                debug!("Peer {} is interested; not uploading", self.peer.addr);
            }
            Message::NotInterested => self.peer.peer_interested = false,
            Message::Have { piece_index } => {
                self.advertised = true;
                scheduler.record_availability(self.id, piece_index).await?;
                self.fill_pipeline(scheduler).await?;
            }
            Message::Bitfield { bitfield } => {
                let bits = Bitfield::from_bytes(&bitfield, scheduler.descriptor().piece_count())?;
                debug!("Peer {} has {} pieces", self.peer.addr, bits.count());
                self.advertised = true;
                scheduler.record_bitfield(self.id, bits).await;
                self.fill_pipeline(scheduler).await?;
            }
            Message::Request { index, begin, length } => {
                debug!("Ignoring request from {}: piece {} offset {} ({} bytes)", self.peer.addr, index, begin, length);
            }
            Message::Cancel { index, begin, .. } => {
                trace!("Ignoring cancel from {}: piece {} offset {}", self.peer.addr, index, begin);
            }
            Message::Piece { index, begin, block } => {
                let request = BlockRequest { piece_index: index, begin, length: block.len() as u32 };
                if !self.peer.outstanding.remove(&request) {
                    trace!("Unrequested block from {}: piece {} offset {}", self.peer.addr, index, begin);
                }
                self.accept_block(request, &block, scheduler, pieces_tx).await?;
                self.fill_pipeline(scheduler).await?;
            }
        }
        Ok(())
    }

    async fn accept_block(
        &mut self,
        request: BlockRequest,
        block: &[u8],
        scheduler: &PieceScheduler,
        pieces_tx: &mpsc::Sender<PieceMessage>,
    ) -> Result<()> {
        match scheduler.record_block(self.id, request.piece_index, request.begin, block).await {
            Ok(Some(piece)) => {
                self.peer.pieces_downloaded += 1;
                pieces_tx
                    .send(piece)
                    .await
                    .map_err(|_| TorrentError::storage_error("Disk writer is no longer accepting pieces"))?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => match e.downcast_ref::<TorrentError>() {
                Some(TorrentError::PieceHashMismatch { piece_index }) => {
                    warn!("Piece {} from {} failed verification, will retry", piece_index, self.peer.addr);
                    Ok(())
                }
                _ => Err(e),
            },
        }
    }

    /// Request blocks until the pipeline is full or the scheduler has no more work for us
    async fn fill_pipeline(&mut self, scheduler: &PieceScheduler) -> Result<()> {
        if !self.peer.can_request() {
            return Ok(());
        }
        while self.peer.request_slots(self.settings.pipeline_depth) > 0 {
            let Some(request) = scheduler.next_block(self.id).await else {
                break;
            };
            trace!(
                "Requesting piece {} offset {} ({} bytes) from {}",
                request.piece_index,
                request.begin,
                request.length,
                self.peer.addr
            );
            self.peer.outstanding.insert(request);
            self.send_message(&Message::Request {
                index: request.piece_index,
                begin: request.begin,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn send_message(&mut self, message: &Message) -> Result<()> {
        let addr = self.peer.addr;
        self.wire.write_message(&mut self.stream, message).await.map_err(|e| {
            error!("Failed to send message to {}: {}", addr, e);
            TorrentError::network_error_full("Failed to send message", addr.to_string(), e.to_string())
        })?;
        Ok(())
    }

    async fn receive_message(&mut self) -> Result<Message> {
        let addr = self.peer.addr;
        let read_timeout = self.settings.read_timeout;
        let message = timeout(read_timeout, self.wire.read_message(&mut self.stream))
            .await
            .map_err(|_| {
                TorrentError::peer_protocol_full(
                    "Receive message timeout",
                    addr.to_string(),
                    format!("nothing read in {:?}", read_timeout),
                )
            })?
            .map_err(|e| {
                if e.downcast_ref::<TorrentError>().is_some() {
                    e
                } else {
                    TorrentError::network_error_full("Failed to read message", addr.to_string(), e.to_string()).into()
                }
            })?;
        trace!("Received {:?} from {}", message.message_id(), addr);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileEntry, BLOCK_SIZE};
    use sha1::{Digest, Sha1};
    use tokio::net::TcpListener;

    fn descriptor(content: &[u8], piece_length: u32) -> Arc<TorrentDescriptor> {
        Arc::new(TorrentDescriptor {
            name: "sample.bin".to_string(),
            info_hash: [7u8; 20],
            piece_length,
            pieces: content
                .chunks(piece_length as usize)
                .map(|chunk| Sha1::digest(chunk).into())
                .collect(),
            multi_file: false,
            files: vec![FileEntry { path: vec!["sample.bin".to_string()], length: content.len() as u64 }],
            announce_list: Vec::new(),
            peer_id: [1u8; 20],
        })
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            pipeline_depth: 4,
        }
    }

    /// Accept one connection and answer the handshake with `info_hash`
    async fn accept_with_handshake(listener: &TcpListener, info_hash: [u8; 20]) -> (TcpStream, BitTorrentWire) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut wire = BitTorrentWire::for_torrent(16);
        let theirs = wire.read_handshake(&mut stream).await.unwrap();
        assert_eq!(theirs.peer_id, [1u8; 20]);
        wire.write_handshake(&mut stream, &Handshake::new(info_hash, [2u8; 20])).await.unwrap();
        (stream, wire)
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = accept_with_handshake(&listener, [9u8; 20]).await;
        });

        let desc = descriptor(b"payload", 16);
        let err = PeerConnection::connect(1, addr, &desc, settings()).await.err().unwrap();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::Handshake { .. })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_downloads_piece_from_seeder() {
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let desc = descriptor(&content, 2 * BLOCK_SIZE);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let served = content.clone();
        let server = tokio::spawn(async move {
            let (mut stream, mut wire) = accept_with_handshake(&listener, [7u8; 20]).await;
            wire.write_message(&mut stream, &Message::Bitfield { bitfield: vec![0b1000_0000] }).await.unwrap();
            assert_eq!(wire.read_message(&mut stream).await.unwrap(), Message::Interested);
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();

            let mut answered = 0;
            while answered < 2 {
                match wire.read_message(&mut stream).await {
                    Ok(Message::Request { index, begin, length }) => {
                        let start = begin as usize;
                        let block = served[start..start + length as usize].to_vec();
                        wire.write_message(&mut stream, &Message::Piece { index, begin, block }).await.unwrap();
                        answered += 1;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            answered
        });

        let scheduler = Arc::new(PieceScheduler::new(desc.clone()));
        let (tx, mut rx) = mpsc::channel(4);
        let connection = PeerConnection::connect(1, addr, &desc, settings()).await.unwrap();
        assert_eq!(connection.peer.state, ConnectionState::Idle);
        connection.run(scheduler.clone(), tx).await.unwrap();

        let piece = rx.recv().await.unwrap();
        assert_eq!(piece.piece_index, 0);
        assert_eq!(piece.offset, 0);
        assert_eq!(piece.data, content);
        assert!(scheduler.is_complete().await);
        assert_eq!(server.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_useless_peer_gets_not_interested() {
        let content = vec![3u8; 40];
        let desc = descriptor(&content, 20);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, mut wire) = accept_with_handshake(&listener, [7u8; 20]).await;
            // a peer with no pieces at all
            wire.write_message(&mut stream, &Message::Bitfield { bitfield: vec![0] }).await.unwrap();
            assert_eq!(wire.read_message(&mut stream).await.unwrap(), Message::Interested);
            wire.read_message(&mut stream).await.unwrap()
        });

        let scheduler = Arc::new(PieceScheduler::new(desc.clone()));
        let (tx, _rx) = mpsc::channel(1);
        let connection = PeerConnection::connect(6, addr, &desc, settings()).await.unwrap();
        connection.run(scheduler.clone(), tx).await.unwrap();

        assert_eq!(server.await.unwrap(), Message::NotInterested);
        assert!(!scheduler.is_complete().await);
    }

    #[tokio::test]
    async fn test_disconnect_releases_outstanding_blocks() {
        let content = vec![5u8; 3 * BLOCK_SIZE as usize];
        let desc = descriptor(&content, 4 * BLOCK_SIZE);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, mut wire) = accept_with_handshake(&listener, [7u8; 20]).await;
            wire.write_message(&mut stream, &Message::Have { piece_index: 0 }).await.unwrap();
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            // wait for the first request, then hang up
            loop {
                if let Message::Request { .. } = wire.read_message(&mut stream).await.unwrap() {
                    break;
                }
            }
        });

        let scheduler = Arc::new(PieceScheduler::new(desc.clone()));
        let (tx, _rx) = mpsc::channel(4);
        let connection = PeerConnection::connect(3, addr, &desc, settings()).await.unwrap();
        assert!(connection.run(scheduler.clone(), tx).await.is_err());
        server.await.unwrap();

        let stats = scheduler.stats().await;
        assert_eq!(stats.blocks_requested, 0);
        assert_eq!(stats.pieces_complete, 0);
        assert!(!scheduler.is_interesting(3).await);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let desc = descriptor(b"0123456789", 16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _wire) = accept_with_handshake(&listener, [7u8; 20]).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(stream);
        });

        let scheduler = Arc::new(PieceScheduler::new(desc.clone()));
        let (tx, _rx) = mpsc::channel(1);
        let fast = ConnectionSettings { read_timeout: Duration::from_millis(100), ..settings() };
        let connection = PeerConnection::connect(4, addr, &desc, fast).await.unwrap();

        let err = connection.run(scheduler, tx).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::PeerProtocol { .. })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let desc = descriptor(b"abc", 16);
        let err = PeerConnection::connect(5, addr, &desc, settings()).await.err().unwrap();
        let kind = err.downcast_ref::<TorrentError>().unwrap();
        assert!(kind.is_peer_scoped());
    }
}
