//! Disk writer
//!
//! The single task that touches destination files. It drains piece
//! messages in arrival order and makes every write durable before
//! reporting it persisted.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::layout::{FileLayout, WriteSegment};
use crate::error::TorrentError;

/// Bytes to persist at a piece-relative offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceMessage {
    pub piece_index: u32,
    /// Offset inside the piece
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Outcome notifications sent by the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    /// Every byte of a message for this piece is on disk
    Persisted(u32),
    /// A file became unwritable; later writes to it are skipped
    Failed { path: PathBuf, error: String },
    /// A message could not be mapped onto the layout and was dropped
    Rejected { piece_index: u32, error: String },
}

/// Totals returned when the writer's channel closes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub messages_written: usize,
    pub bytes_written: u64,
    pub failed_files: Vec<PathBuf>,
}

pub struct DiskWriter {
    layout: FileLayout,
    handles: HashMap<usize, File>,
    failed: HashSet<usize>,
    events: mpsc::UnboundedSender<WriterEvent>,
    report: WriterReport,
}

impl DiskWriter {
    pub fn new(layout: FileLayout, events: mpsc::UnboundedSender<WriterEvent>) -> Self {
        Self {
            layout,
            handles: HashMap::new(),
            failed: HashSet::new(),
            events,
            report: WriterReport::default(),
        }
    }

    /// Drain `rx` until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<PieceMessage>) -> WriterReport {
        info!("Disk writer started for {} files", self.layout.files().len());
        while let Some(message) = rx.recv().await {
            match self.write(&message).await {
                Ok(true) => {
                    self.report.messages_written += 1;
                    self.report.bytes_written += message.data.len() as u64;
                    let _ = self.events.send(WriterEvent::Persisted(message.piece_index));
                }
                Ok(false) => {
                    warn!("Piece {} not fully persisted: destination file unavailable", message.piece_index);
                }
                Err(e) => {
                    error!("Failed to persist piece {}: {}", message.piece_index, e);
                    let _ = self.events.send(WriterEvent::Rejected {
                        piece_index: message.piece_index,
                        error: e.to_string(),
                    });
                }
            }
        }

        for (index, file) in self.handles.drain() {
            if let Err(e) = file.sync_all().await {
                warn!("Final sync of {} failed: {}", self.layout.files()[index].path.display(), e);
            }
        }
        info!(
            "Disk writer finished: {} messages, {} bytes",
            self.report.messages_written, self.report.bytes_written
        );
        self.report
    }

    /// Write one message. Returns `Ok(false)` if any part landed in a failed file.
    pub async fn write(&mut self, message: &PieceMessage) -> Result<bool> {
        let abs_offset = self.layout.absolute_offset(message.piece_index, message.offset);
        let segments = self.layout.segments(abs_offset, message.data.len())?;
        trace!(
            "Piece {} offset {} spans {} file segment(s)",
            message.piece_index,
            message.offset,
            segments.len()
        );

        let mut complete = true;
        for segment in segments {
            if self.failed.contains(&segment.file_index) {
                complete = false;
                continue;
            }
            if let Err(e) = self.write_segment(&segment, &message.data[segment.range.clone()]).await {
                let path = self.layout.files()[segment.file_index].path.clone();
                error!("Giving up on {}: {}", path.display(), e);
                self.failed.insert(segment.file_index);
                self.handles.remove(&segment.file_index);
                self.report.failed_files.push(path.clone());
                let _ = self.events.send(WriterEvent::Failed { path, error: e.to_string() });
                complete = false;
            }
        }
        Ok(complete)
    }

    async fn write_segment(&mut self, segment: &WriteSegment, bytes: &[u8]) -> Result<()> {
        let path = &self.layout.files()[segment.file_index].path;
        let storage_err = |what: &str, e: std::io::Error| {
            TorrentError::storage_error_full(what.to_string(), path.display().to_string(), e.to_string())
        };

        if !self.handles.contains_key(&segment.file_index) {
            debug!("Opening {}", path.display());
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| storage_err("Failed to open file for writing", e))?;
            self.handles.insert(segment.file_index, file);
        }
        let file = self
            .handles
            .get_mut(&segment.file_index)
            .ok_or_else(|| TorrentError::storage_error("File handle missing"))?;

        file.seek(std::io::SeekFrom::Start(segment.file_offset))
            .await
            .map_err(|e| storage_err("Failed to seek in file", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| storage_err("Failed to write to file", e))?;
        file.sync_data()
            .await
            .map_err(|e| storage_err("Failed to sync file", e))?;
        trace!("Wrote {} bytes to {} at {}", bytes.len(), path.display(), segment.file_offset);
        Ok(())
    }
}
