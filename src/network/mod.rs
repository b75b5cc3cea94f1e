//! Network Module
//!
//! Handles TCP communication between a follower and its leader.

mod client;
pub mod protocol;
mod server;
mod service;

pub use client::TcpLeaderTransport;
pub use protocol::{ErrorCode, FrameHeader, Message};
pub use server::LeaderServer;
pub use service::LeaderService;

use crate::error::{Error, Result};
use protocol::MAX_FRAME_SIZE;

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Message::decode(&body)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    compress: bool,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.encode(compress)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
