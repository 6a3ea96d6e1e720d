//! Per-piece download state

use sha1::{Digest, Sha1};

/// Identifies one peer connection inside the scheduler
pub type ConnectionId = u64;

/// Lifecycle of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// No block received or requested
    Missing,
    /// Some blocks requested or received
    InProgress,
    /// Every block received and the hash matched
    Complete,
}

/// Lifecycle of a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    /// Outstanding on exactly one connection
    Requested(ConnectionId),
    Received,
}

/// Download state of one piece
#[derive(Debug)]
pub struct PieceState {
    /// Current status
    pub status: PieceStatus,
    /// One entry per block
    pub blocks: Vec<BlockState>,
    /// Number of blocks in `Received`
    pub received: usize,
    /// Assembly buffer, allocated when the first block is requested
    pub buffer: Vec<u8>,
    /// Peers known to have this piece
    pub peer_count: u32,
    /// Actual piece size
    pub size: u32,
}

impl PieceState {
    pub fn new(size: u32, block_count: u32) -> Self {
        Self {
            status: PieceStatus::Missing,
            blocks: vec![BlockState::Missing; block_count as usize],
            received: 0,
            buffer: Vec::new(),
            peer_count: 0,
            size,
        }
    }

    /// First block nobody has received or requested
    pub fn first_missing_block(&self) -> Option<usize> {
        self.blocks.iter().position(|b| *b == BlockState::Missing)
    }

    pub fn is_complete(&self) -> bool {
        self.status == PieceStatus::Complete
    }

    pub fn all_received(&self) -> bool {
        self.received == self.blocks.len()
    }

    /// Store block data at `begin`
    pub fn store(&mut self, block: usize, begin: usize, data: &[u8]) {
        if self.buffer.is_empty() {
            self.buffer = vec![0u8; self.size as usize];
        }
        self.buffer[begin..begin + data.len()].copy_from_slice(data);
        self.blocks[block] = BlockState::Received;
        self.received += 1;
        self.status = PieceStatus::InProgress;
    }

    /// Compare the assembled bytes against the expected SHA-1
    pub fn verify(&self, expected: &[u8; 20]) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.buffer).into();
        digest == *expected
    }

    /// Drop every block and the buffer
    pub fn reset(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = BlockState::Missing);
        self.received = 0;
        self.buffer = Vec::new();
        self.status = PieceStatus::Missing;
    }

    /// Return blocks held by `conn` to `Missing`. Returns how many were released.
    pub fn release(&mut self, conn: ConnectionId) -> usize {
        let mut released = 0;
        for block in self.blocks.iter_mut() {
            if *block == BlockState::Requested(conn) {
                *block = BlockState::Missing;
                released += 1;
            }
        }
        if released > 0 && self.received == 0 && !self.blocks.iter().any(|b| matches!(b, BlockState::Requested(_))) {
            self.status = PieceStatus::Missing;
            self.buffer = Vec::new();
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_verify() {
        let mut piece = PieceState::new(6, 2);
        piece.store(1, 3, b"def");
        assert!(!piece.all_received());
        piece.store(0, 0, b"abc");
        assert!(piece.all_received());
        let expected: [u8; 20] = Sha1::digest(b"abcdef").into();
        assert!(piece.verify(&expected));
        assert!(!piece.verify(&[0u8; 20]));
    }

    #[test]
    fn test_release_returns_to_missing() {
        let mut piece = PieceState::new(6, 2);
        piece.blocks[0] = BlockState::Requested(1);
        piece.blocks[1] = BlockState::Requested(2);
        piece.status = PieceStatus::InProgress;

        assert_eq!(piece.release(1), 1);
        assert_eq!(piece.status, PieceStatus::InProgress);
        assert_eq!(piece.release(2), 1);
        assert_eq!(piece.status, PieceStatus::Missing);
        assert_eq!(piece.first_missing_block(), Some(0));
    }

    #[test]
    fn test_reset() {
        let mut piece = PieceState::new(3, 1);
        piece.store(0, 0, b"xyz");
        piece.reset();
        assert_eq!(piece.received, 0);
        assert!(piece.buffer.is_empty());
        assert_eq!(piece.status, PieceStatus::Missing);
    }
}
