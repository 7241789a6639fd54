//! Wire protocol framing
//!
//! Reads and writes handshakes and length-prefixed messages on async streams.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::{Handshake, Message};
use crate::error::TorrentError;

/// Largest frame accepted from a peer: a full 1 MiB block plus the Piece header
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024 + 13;

/// Async framing of peer protocol messages
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin + Send>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin + Send>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Default, Clone, Copy)]
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin + Send>(&mut self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Frame too large",
                format!("{} bytes, limit {}", length, MAX_FRAME_LENGTH),
            )
            .into());
        }

        let mut frame = vec![0u8; 4 + length];
        frame[..4].copy_from_slice(&length_buf);
        reader.read_exact(&mut frame[4..]).await?;
        trace!("Read frame of {} bytes", frame.len());

        Message::from_bytes(&frame, 0, frame.len())
    }

    async fn write_message<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin + Send>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; Handshake::MESSAGE_LENGTH];
        reader.read_exact(&mut buf).await?;
        Handshake::from_bytes(&buf, 0, buf.len())
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin + Send>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        let mut buf = [0u8; Handshake::MESSAGE_LENGTH];
        handshake.to_bytes(&mut buf, 0)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut wire = BitTorrentWire;
        let handshake = Handshake::new([5u8; 20], [6u8; 20]);

        wire.write_handshake(&mut client, &handshake).await.unwrap();
        let received = wire.read_handshake(&mut server).await.unwrap();
        assert_eq!(received, handshake);
    }

    #[tokio::test]
    async fn test_messages_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;

        let sent = vec![
            Message::Interested,
            Message::KeepAlive,
            Message::Piece { index: 1, begin: 0, block: vec![7u8; 100] },
        ];
        for message in &sent {
            wire.write_message(&mut client, message).await.unwrap();
        }
        for message in &sent {
            assert_eq!(&wire.read_message(&mut server).await.unwrap(), message);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = BitTorrentWire.read_message(&mut server).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[19, b'B', b'i']).await.unwrap();
        drop(client);
        assert!(BitTorrentWire.read_handshake(&mut server).await.is_err());
    }
}
