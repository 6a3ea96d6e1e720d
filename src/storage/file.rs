//! Destination file preparation
//!
//! Creates every file the layout names before any data is written.

use anyhow::Result;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::layout::FileLayout;
use crate::error::TorrentError;

/// Create parent directories and size each destination file to its final length.
///
/// Existing files are truncated or extended in place. Sparse allocation is
/// left to the filesystem.
pub async fn prepare_files(layout: &FileLayout) -> Result<()> {
    info!("Preparing {} destination files", layout.files().len());

    for file in layout.files() {
        if let Some(parent) = file.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating directory: {}", parent.display());
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full(
                        "Failed to create directory",
                        parent.display().to_string(),
                        e.to_string(),
                    )
                })?;
            }
        }

        debug!("Creating file: {} ({} bytes)", file.path.display(), file.length);
        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file.path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", file.path.display(), e);
                TorrentError::storage_error_full("Failed to create file", file.path.display().to_string(), e.to_string())
            })?;
        handle.set_len(file.length).await.map_err(|e| {
            error!("Failed to set file length for '{}': {}", file.path.display(), e);
            TorrentError::storage_error_full("Failed to set file length", file.path.display().to_string(), e.to_string())
        })?;
        handle.flush().await.map_err(|e| {
            TorrentError::storage_error_full("Failed to flush file", file.path.display().to_string(), e.to_string())
        })?;
    }

    info!("Destination files ready ({} bytes total)", layout.total_length());
    Ok(())
}
