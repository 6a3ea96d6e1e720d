//! Torrent descriptor
//!
//! Read-only view of a parsed torrent: identity, piece geometry and file layout.

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

/// Size of a wire request. Only the final block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// Client prefix of the locally generated peer id
pub const PEER_ID_PREFIX: &[u8; 8] = b"-LC0001-";

/// One file of the torrent, in concatenation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the download root
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Everything the engine needs to know about a torrent
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Suggested name of the file or top-level directory
    pub name: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Nominal size of each piece
    pub piece_length: u32,
    /// Expected SHA-1 of every piece, by index
    pub pieces: Vec<[u8; 20]>,
    /// Whether the torrent used the `files` form
    pub multi_file: bool,
    /// Files in concatenation order. A single-file torrent has exactly one entry.
    pub files: Vec<FileEntry>,
    /// Tracker URLs, primary first, deduplicated
    pub announce_list: Vec<String>,
    /// Our peer id for this session
    pub peer_id: [u8; 20],
}

impl TorrentDescriptor {
    /// Total content length across all files
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Absolute byte offset where a piece starts
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Actual size of a piece; only the last one can be short.
    ///
    /// Returns 0 for an index past the end.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = self.piece_offset(index);
        let total = self.total_length();
        if start >= total {
            return 0;
        }
        (total - start).min(self.piece_length as u64) as u32
    }

    /// Number of blocks in a piece
    pub fn block_count(&self, index: u32) -> u32 {
        self.piece_size(index).div_ceil(BLOCK_SIZE)
    }

    /// Length of block `block` within piece `index`
    pub fn block_length(&self, index: u32, block: u32) -> u32 {
        let size = self.piece_size(index);
        let begin = block.saturating_mul(BLOCK_SIZE);
        size.saturating_sub(begin).min(BLOCK_SIZE)
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.pieces.get(index as usize)
    }

    /// Absolute `[start, end)` byte range of a piece
    pub fn piece_range(&self, index: u32) -> Option<(u64, u64)> {
        if index as usize >= self.pieces.len() {
            return None;
        }
        let start = self.piece_offset(index);
        Some((start, start + self.piece_size(index) as u64))
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Size of a bitfield message payload for this torrent
    pub fn bitfield_len(&self) -> usize {
        self.pieces.len().div_ceil(8)
    }
}

/// Generate a peer id: the client prefix followed by 12 random alphanumerics
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    debug!("Generated peer id: {}", String::from_utf8_lossy(&peer_id));
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(piece_length: u32, lengths: &[u64]) -> TorrentDescriptor {
        let total: u64 = lengths.iter().sum();
        let count = total.div_ceil(piece_length as u64) as usize;
        TorrentDescriptor {
            name: "test".to_string(),
            info_hash: [0u8; 20],
            piece_length,
            pieces: vec![[0u8; 20]; count],
            multi_file: lengths.len() > 1,
            files: lengths
                .iter()
                .enumerate()
                .map(|(i, &length)| FileEntry { path: vec![format!("f{}", i)], length })
                .collect(),
            announce_list: Vec::new(),
            peer_id: [0u8; 20],
        }
    }

    #[test]
    fn test_piece_sizes_sum_to_total() {
        let desc = descriptor(32768, &[50000, 20000]);
        let sum: u64 = (0..desc.piece_count() as u32).map(|i| desc.piece_size(i) as u64).sum();
        assert_eq!(sum, desc.total_length());
        let last = desc.piece_size(desc.piece_count() as u32 - 1);
        assert!(last <= desc.piece_length);
        assert_eq!(last, 70000 - 2 * 32768);
    }

    #[test]
    fn test_block_geometry() {
        let desc = descriptor(32768, &[40000]);
        assert_eq!(desc.block_count(0), 2);
        assert_eq!(desc.block_length(0, 0), BLOCK_SIZE);
        assert_eq!(desc.block_length(0, 1), BLOCK_SIZE);
        // last piece is 7232 bytes
        assert_eq!(desc.piece_size(1), 7232);
        assert_eq!(desc.block_count(1), 1);
        assert_eq!(desc.block_length(1, 0), 7232);
        assert_eq!(desc.block_length(1, 1), 0);
    }

    #[test]
    fn test_piece_range() {
        let desc = descriptor(100, &[250]);
        assert_eq!(desc.piece_range(0), Some((0, 100)));
        assert_eq!(desc.piece_range(2), Some((200, 250)));
        assert_eq!(desc.piece_range(3), None);
        assert_eq!(desc.piece_size(3), 0);
    }

    #[test]
    fn test_bitfield_len() {
        assert_eq!(descriptor(100, &[800]).bitfield_len(), 1);
        assert_eq!(descriptor(100, &[900]).bitfield_len(), 2);
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
        assert!(peer_id[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(generate_peer_id(), peer_id);
    }
}
