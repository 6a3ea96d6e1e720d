//! Piece bitfield
//!
//! One bit per piece, most significant bit first within each byte.

use anyhow::Result;

use crate::error::TorrentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Bitfield received from a peer.
    ///
    /// The payload must be exactly `ceil(len / 8)` bytes. Spare bits past
    /// `len` are dropped.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::peer_protocol_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes, got {}", expected, bytes.len()),
            )
            .into());
        }
        let mut bits = bytes.to_vec();
        let spare = expected * 8 - len;
        if spare > 0 {
            if let Some(last) = bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
        Ok(Self { bits, len })
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Set a bit. Returns false if `index` is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
        true
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indices of all set bits, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.has(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
