//! Wire protocol utilities
//!
//! Reading and writing handshakes and framed messages on an async stream.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, trace};

use super::{Handshake, Message, HANDSHAKE_LEN};
use crate::error::TorrentError;
use crate::torrent::BLOCK_SIZE;

/// Frame I/O over any async byte stream
#[allow(async_fn_in_trait)]
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Clone, Copy)]
pub struct BitTorrentWire {
    /// Largest accepted value of a length prefix
    max_frame_len: u32,
}

impl BitTorrentWire {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }

    /// Frame limit for a torrent: a full block or a full bitfield, whichever is larger
    pub fn for_torrent(bitfield_len: usize) -> Self {
        let block_frame = BLOCK_SIZE + 9;
        let bitfield_frame = u32::try_from(bitfield_len).unwrap_or(u32::MAX).saturating_add(1);
        Self::new(block_frame.max(bitfield_frame))
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf);

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > self.max_frame_len {
            error!("Frame of {} bytes exceeds limit of {}", length, self.max_frame_len);
            return Err(TorrentError::peer_protocol_with_source(
                "Message too long",
                format!("length {}, limit {}", length, self.max_frame_len),
            )
            .into());
        }

        let mut frame = vec![0u8; 4 + length as usize];
        frame[..4].copy_from_slice(&length_buf);
        reader.read_exact(&mut frame[4..]).await?;
        trace!("Read frame of {} bytes", length);

        Message::deserialize(&frame)
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}
