//! Peer manager module
//!
//! Owns the pool of connection tasks and bounds how many run at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::{ConnectionSettings, PeerConnection};
use crate::scheduler::{ConnectionId, PieceScheduler};
use crate::storage::PieceMessage;
use crate::torrent::TorrentDescriptor;
use crate::tracker::PeerAddress;

/// How a connection task ended
#[derive(Debug)]
pub struct ConnectionOutcome {
    pub addr: SocketAddr,
    pub result: Result<()>,
}

/// Manages all peer connections for a torrent
pub struct PeerManager {
    descriptor: Arc<TorrentDescriptor>,
    scheduler: Arc<PieceScheduler>,
    pieces_tx: mpsc::Sender<PieceMessage>,
    settings: ConnectionSettings,
    max_connections: usize,
    tasks: JoinSet<ConnectionOutcome>,
    /// Which connection each running task drives
    running: HashMap<task::Id, (ConnectionId, SocketAddr)>,
    /// Addresses waiting for a free slot
    pending: VecDeque<SocketAddr>,
    /// Every address ever queued; closed peers are not retried
    seen: HashSet<SocketAddr>,
    next_id: ConnectionId,
}

impl PeerManager {
    pub fn new(
        scheduler: Arc<PieceScheduler>,
        pieces_tx: mpsc::Sender<PieceMessage>,
        settings: ConnectionSettings,
        max_connections: usize,
    ) -> Self {
        Self {
            descriptor: scheduler.descriptor().clone(),
            scheduler,
            pieces_tx,
            settings,
            max_connections,
            tasks: JoinSet::new(),
            running: HashMap::new(),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            next_id: 1,
        }
    }

    /// Queue newly discovered addresses and start connections up to the limit.
    /// Returns how many addresses were new.
    pub fn add_peers(&mut self, addrs: impl IntoIterator<Item = PeerAddress>) -> usize {
        let mut added = 0;
        for peer in addrs {
            let addr = peer.socket_addr();
            if self.seen.insert(addr) {
                self.pending.push_back(addr);
                added += 1;
            } else {
                trace!("Peer {} already known, skipping", addr);
            }
        }
        if added > 0 {
            debug!("Queued {} new peers ({} pending)", added, self.pending.len());
        }
        self.fill_slots();
        added
    }

    fn fill_slots(&mut self) {
        while self.tasks.len() < self.max_connections {
            let Some(addr) = self.pending.pop_front() else {
                break;
            };
            let id = self.next_id;
            self.next_id += 1;

            let descriptor = self.descriptor.clone();
            let scheduler = self.scheduler.clone();
            let pieces_tx = self.pieces_tx.clone();
            let settings = self.settings;
            self.track(id, addr, async move {
                let result = async {
                    let connection = PeerConnection::connect(id, addr, &descriptor, settings).await?;
                    connection.run(scheduler, pieces_tx).await
                }
                .await;
                ConnectionOutcome { addr, result }
            });
            trace!("Spawned connection {} to {}", id, addr);
        }
    }

    fn track<F>(&mut self, id: ConnectionId, addr: SocketAddr, connection: F)
    where
        F: Future<Output = ConnectionOutcome> + Send + 'static,
    {
        let handle = self.tasks.spawn(connection);
        self.running.insert(handle.id(), (id, addr));
    }

    /// Wait for the next connection task to end and start a queued one in its place.
    ///
    /// Returns `None` immediately when no connection is running.
    pub async fn join_next(&mut self) -> Option<ConnectionOutcome> {
        let outcome = loop {
            match self.tasks.join_next_with_id().await? {
                Ok((task_id, outcome)) => {
                    self.running.remove(&task_id);
                    break outcome;
                }
                Err(e) => match self.running.remove(&e.id()) {
                    Some((conn, addr)) => {
                        warn!("Connection {} to {} ended abnormally: {}", conn, addr, e);
                        // the task never reached its own cleanup
                        self.scheduler.remove_connection(conn).await;
                        break ConnectionOutcome {
                            addr,
                            result: Err(TorrentError::network_error_full(
                                "Connection task failed",
                                addr.to_string(),
                                e.to_string(),
                            )
                            .into()),
                        };
                    }
                    None => warn!("Untracked connection task ended: {}", e),
                },
            }
        };
        match &outcome.result {
            Ok(()) => debug!("Connection to {} done", outcome.addr),
            Err(e) => match e.downcast_ref::<TorrentError>() {
                Some(err) if err.is_peer_scoped() => debug!("Peer {} dropped: {}", outcome.addr, err),
                _ => warn!("Peer {} failed: {}", outcome.addr, e),
            },
        }
        self.fill_slots();
        Some(outcome)
    }

    /// Connections currently running
    pub fn connection_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.max_connections
    }

    /// Abort every connection task and wait for them to stop
    pub async fn shutdown(&mut self) {
        info!("Closing {} peer connections", self.tasks.len());
        self.pending.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.running.clear();
    }
}
