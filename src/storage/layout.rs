//! File layout
//!
//! Maps the torrent's linear byte space onto its files.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::TorrentError;
use crate::torrent::TorrentDescriptor;

/// One destination file and where it sits in the torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutFile {
    /// Absolute or output-relative path on disk
    pub path: PathBuf,
    /// Offset of the file's first byte in the torrent
    pub offset: u64,
    /// File size in bytes
    pub length: u64,
}

/// Part of a write that lands in a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSegment {
    /// Index into [`FileLayout::files`]
    pub file_index: usize,
    /// Position inside that file
    pub file_offset: u64,
    /// Slice of the payload to write there
    pub range: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<LayoutFile>,
    piece_length: u32,
    total_length: u64,
}

impl FileLayout {
    /// Single-file torrents land at `<out>/<name>`, multi-file torrents
    /// under `<out>/<name>/`.
    pub fn from_descriptor(out_dir: &Path, descriptor: &TorrentDescriptor) -> Self {
        let root = if descriptor.multi_file {
            out_dir.join(&descriptor.name)
        } else {
            out_dir.to_path_buf()
        };

        let mut offset = 0;
        let files = descriptor
            .files
            .iter()
            .map(|entry| {
                let path = entry.path.iter().fold(root.clone(), |p, c| p.join(c));
                let file = LayoutFile { path, offset, length: entry.length };
                offset += entry.length;
                file
            })
            .collect();

        Self {
            files,
            piece_length: descriptor.piece_length,
            total_length: offset,
        }
    }

    pub fn files(&self) -> &[LayoutFile] {
        &self.files
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Absolute torrent offset of a byte inside a piece
    pub fn absolute_offset(&self, piece_index: u32, offset: u32) -> u64 {
        piece_index as u64 * self.piece_length as u64 + offset as u64
    }

    /// Split a write of `len` bytes at `abs_offset` across the files it touches
    pub fn segments(&self, abs_offset: u64, len: usize) -> Result<Vec<WriteSegment>> {
        let end = abs_offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.total_length)
            .ok_or_else(|| {
                TorrentError::storage_error(format!(
                    "Write of {} bytes at {} runs past end of torrent ({} bytes)",
                    len, abs_offset, self.total_length
                ))
            })?;

        let mut segments = Vec::new();
        let mut position = abs_offset;
        for (file_index, file) in self.files.iter().enumerate() {
            if position >= end {
                break;
            }
            let file_end = file.offset + file.length;
            if file_end <= position {
                continue;
            }
            let file_offset = position - file.offset;
            let take = (file_end.min(end) - position) as usize;
            let start = (position - abs_offset) as usize;
            segments.push(WriteSegment {
                file_index,
                file_offset,
                range: start..start + take,
            });
            position += take as u64;
        }
        Ok(segments)
    }
}
