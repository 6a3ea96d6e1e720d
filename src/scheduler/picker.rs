//! Shared piece scheduler
//!
//! The only owner of piece and block status. Connections ask it for work,
//! report availability and hand in received blocks; it hands back verified
//! pieces ready for the disk writer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

use super::piece::{BlockState, ConnectionId, PieceState, PieceStatus};
use crate::error::TorrentError;
use crate::protocol::Bitfield;
use crate::storage::PieceMessage;
use crate::torrent::{TorrentDescriptor, BLOCK_SIZE};

/// A block a connection should request next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Snapshot of scheduler progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Pieces verified
    pub pieces_complete: usize,
    /// Pieces in the torrent
    pub pieces_total: usize,
    /// Bytes in verified pieces
    pub bytes_complete: u64,
    /// Pieces that failed verification and were discarded
    pub hash_failures: u64,
    /// Blocks currently outstanding on any connection
    pub blocks_requested: usize,
}

#[derive(Debug)]
struct SchedulerState {
    pieces: Vec<PieceState>,
    availability: HashMap<ConnectionId, Bitfield>,
    completed: usize,
    bytes_complete: u64,
    hash_failures: u64,
}

/// Piece and block scheduler shared by every connection
#[derive(Debug)]
pub struct PieceScheduler {
    descriptor: Arc<TorrentDescriptor>,
    state: Mutex<SchedulerState>,
    done: Notify,
}

impl PieceScheduler {
    pub fn new(descriptor: Arc<TorrentDescriptor>) -> Self {
        let pieces = (0..descriptor.piece_count() as u32)
            .map(|i| PieceState::new(descriptor.piece_size(i), descriptor.block_count(i)))
            .collect();
        debug!("Scheduler tracking {} pieces", descriptor.piece_count());
        Self {
            descriptor,
            state: Mutex::new(SchedulerState {
                pieces,
                availability: HashMap::new(),
                completed: 0,
                bytes_complete: 0,
                hash_failures: 0,
            }),
            done: Notify::new(),
        }
    }

    pub fn descriptor(&self) -> &Arc<TorrentDescriptor> {
        &self.descriptor
    }

    /// Pick the next block for `conn` and mark it outstanding.
    ///
    /// Only pieces the connection has advertised are considered. Pieces
    /// already in progress come first, then scarcer pieces, then lower indexes.
    pub async fn next_block(&self, conn: ConnectionId) -> Option<BlockRequest> {
        let mut state = self.state.lock().await;
        let SchedulerState { pieces, availability, .. } = &mut *state;
        let available = availability.get(&conn)?;

        let mut best: Option<((bool, u32, usize), usize)> = None;
        for index in available.iter_set() {
            let piece = &pieces[index];
            if piece.is_complete() || piece.first_missing_block().is_none() {
                continue;
            }
            let key = (piece.status != PieceStatus::InProgress, piece.peer_count, index);
            if best.map_or(true, |(best_key, _)| key < best_key) {
                best = Some((key, index));
            }
        }

        let (_, index) = best?;
        let piece = &mut pieces[index];
        let block = piece.first_missing_block()?;
        piece.blocks[block] = BlockState::Requested(conn);
        piece.status = PieceStatus::InProgress;

        let request = BlockRequest {
            piece_index: index as u32,
            begin: block as u32 * BLOCK_SIZE,
            length: self.descriptor.block_length(index as u32, block as u32),
        };
        trace!("Connection {} assigned piece {} offset {}", conn, request.piece_index, request.begin);
        Some(request)
    }

    /// Accept a received block.
    ///
    /// Returns the whole verified piece once its last block arrives, and
    /// `None` while the piece is still incomplete or if the block was a
    /// duplicate. A hash mismatch discards every block of the piece.
    pub async fn record_block(
        &self,
        conn: ConnectionId,
        piece_index: u32,
        begin: u32,
        data: &[u8],
    ) -> Result<Option<PieceMessage>> {
        let index = piece_index as usize;
        if index >= self.descriptor.piece_count() {
            return Err(TorrentError::peer_protocol_with_source(
                "Piece index out of range",
                format!("index {}, piece count {}", piece_index, self.descriptor.piece_count()),
            )
            .into());
        }
        if begin % BLOCK_SIZE != 0 {
            return Err(TorrentError::peer_protocol_with_source(
                "Unaligned block offset",
                format!("piece {}, begin {}", piece_index, begin),
            )
            .into());
        }
        let block = begin / BLOCK_SIZE;
        let expected_len = self.descriptor.block_length(piece_index, block);
        if expected_len == 0 || data.len() != expected_len as usize {
            return Err(TorrentError::peer_protocol_with_source(
                "Unexpected block length",
                format!("piece {}, begin {}, got {} bytes, expected {}", piece_index, begin, data.len(), expected_len),
            )
            .into());
        }

        let mut state = self.state.lock().await;
        let piece = &mut state.pieces[index];
        if piece.is_complete() || piece.blocks[block as usize] == BlockState::Received {
            trace!("Duplicate block from connection {}: piece {} offset {}", conn, piece_index, begin);
            return Ok(None);
        }

        piece.store(block as usize, begin as usize, data);
        if !piece.all_received() {
            return Ok(None);
        }

        let expected_hash = self
            .descriptor
            .piece_hash(piece_index)
            .ok_or_else(|| TorrentError::piece_hash_mismatch(piece_index))?;
        if !piece.verify(expected_hash) {
            warn!("Piece {} failed hash check, discarding its blocks", piece_index);
            piece.reset();
            state.hash_failures += 1;
            return Err(TorrentError::piece_hash_mismatch(piece_index).into());
        }

        piece.status = PieceStatus::Complete;
        let data = std::mem::take(&mut piece.buffer);
        state.completed += 1;
        state.bytes_complete += data.len() as u64;
        debug!(
            "Piece {} verified ({}/{})",
            piece_index,
            state.completed,
            self.descriptor.piece_count()
        );

        if state.completed == self.descriptor.piece_count() {
            info!("All {} pieces verified", state.completed);
            self.done.notify_waiters();
        }

        Ok(Some(PieceMessage {
            piece_index,
            offset: 0,
            data,
        }))
    }

    /// Note that `conn` has piece `piece_index` (a `have` message)
    pub async fn record_availability(&self, conn: ConnectionId, piece_index: u32) -> Result<()> {
        let count = self.descriptor.piece_count();
        if piece_index as usize >= count {
            return Err(TorrentError::peer_protocol_with_source(
                "Have index out of range",
                format!("index {}, piece count {}", piece_index, count),
            )
            .into());
        }

        let mut state = self.state.lock().await;
        let SchedulerState { pieces, availability, .. } = &mut *state;
        let bitfield = availability.entry(conn).or_insert_with(|| Bitfield::new(count));
        if !bitfield.has(piece_index as usize) {
            bitfield.set(piece_index as usize);
            pieces[piece_index as usize].peer_count += 1;
        }
        Ok(())
    }

    /// Replace what `conn` is known to have (a `bitfield` message)
    pub async fn record_bitfield(&self, conn: ConnectionId, bitfield: Bitfield) {
        let mut state = self.state.lock().await;
        let SchedulerState { pieces, availability, .. } = &mut *state;
        if let Some(old) = availability.get(&conn) {
            for index in old.iter_set() {
                pieces[index].peer_count = pieces[index].peer_count.saturating_sub(1);
            }
        }
        for index in bitfield.iter_set() {
            pieces[index].peer_count += 1;
        }
        trace!("Connection {} has {} pieces", conn, bitfield.count());
        availability.insert(conn, bitfield);
    }

    /// Whether `conn` has any piece we still need
    pub async fn is_interesting(&self, conn: ConnectionId) -> bool {
        let state = self.state.lock().await;
        state
            .availability
            .get(&conn)
            .map_or(false, |bits| bits.iter_set().any(|i| !state.pieces[i].is_complete()))
    }

    /// Return every block outstanding on `conn` to the pool
    pub async fn release_requests(&self, conn: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        let released: usize = state.pieces.iter_mut().map(|p| p.release(conn)).sum();
        if released > 0 {
            debug!("Released {} blocks held by connection {}", released, conn);
        }
        released
    }

    /// Forget a closed connection: release its blocks and its availability
    pub async fn remove_connection(&self, conn: ConnectionId) {
        let mut state = self.state.lock().await;
        let SchedulerState { pieces, availability, .. } = &mut *state;
        let released: usize = pieces.iter_mut().map(|p| p.release(conn)).sum();
        if let Some(bits) = availability.remove(&conn) {
            for index in bits.iter_set() {
                pieces[index].peer_count = pieces[index].peer_count.saturating_sub(1);
            }
        }
        debug!("Removed connection {} ({} blocks released)", conn, released);
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.completed == self.descriptor.piece_count()
    }

    /// Resolve once every piece is verified
    pub async fn wait_complete(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_complete().await {
                return;
            }
            notified.await;
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        SchedulerStats {
            pieces_complete: state.completed,
            pieces_total: self.descriptor.piece_count(),
            bytes_complete: state.bytes_complete,
            hash_failures: state.hash_failures,
            blocks_requested: state
                .pieces
                .iter()
                .flat_map(|p| p.blocks.iter())
                .filter(|b| matches!(b, BlockState::Requested(_)))
                .count(),
        }
    }
}
