//! BitTorrent protocol messages
//!
//! Length-prefixed peer messages exchanged after the handshake.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;
use crate::strategy::Block;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Request for a selected block
    pub fn request(block: &Block) -> Self {
        Message::Request {
            index: block.piece_index,
            begin: block.offset,
            length: block.length,
        }
    }

    /// Get the message ID (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Value of the length prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Encoded size including the 4-byte length prefix
    pub fn message_length(&self) -> usize {
        4 + self.length() as usize
    }

    /// Block carried by a Piece message
    pub fn as_block(&self) -> Option<Block> {
        match self {
            Message::Piece { index, begin, block } => Some(Block::new(*index, *begin, block.len() as u32)),
            _ => None,
        }
    }

    /// Write the message into `buf` at `offset`, returning the bytes written
    pub fn to_bytes(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let serialized = self.serialize();
        let end = offset
            .checked_add(serialized.len())
            .ok_or_else(|| TorrentError::invalid_length(serialized.len(), buf.len().saturating_sub(offset)))?;
        if buf.len() < end {
            return Err(TorrentError::invalid_length(end, buf.len()).into());
        }
        buf[offset..end].copy_from_slice(&serialized);
        Ok(serialized.len())
    }

    /// Read a message from `count` bytes of `buf` starting at `offset`.
    /// `count` must match the length prefix exactly.
    pub fn from_bytes(buf: &[u8], offset: usize, count: usize) -> Result<Self> {
        let end = offset
            .checked_add(count)
            .ok_or_else(|| TorrentError::invalid_length(buf.len().saturating_sub(offset), count))?;
        let data = buf
            .get(offset..end)
            .ok_or_else(|| TorrentError::invalid_length(end, buf.len()))?;
        if data.len() < 4 {
            return Err(TorrentError::invalid_length(4, data.len()).into());
        }

        let mut cursor = data;
        let declared = cursor.get_u32() as usize;
        if declared.checked_add(4) != Some(count) {
            return Err(TorrentError::invalid_length(declared.saturating_add(4), count).into());
        }
        if declared == 0 {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(cursor.get_u8())?;
        let payload = cursor.remaining();
        let expect = |expected: usize| -> Result<()> {
            if payload != expected {
                return Err(TorrentError::invalid_length(expected + 5, payload + 5).into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have { piece_index: cursor.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: cursor.to_vec() },
            MessageId::Request => {
                expect(12)?;
                Message::Request {
                    index: cursor.get_u32(),
                    begin: cursor.get_u32(),
                    length: cursor.get_u32(),
                }
            }
            MessageId::Piece => {
                if payload < 8 {
                    return Err(TorrentError::invalid_length(13, payload + 5).into());
                }
                let index = cursor.get_u32();
                let begin = cursor.get_u32();
                Message::Piece { index, begin, block: cursor.to_vec() }
            }
            MessageId::Cancel => {
                expect(12)?;
                Message::Cancel {
                    index: cursor.get_u32(),
                    begin: cursor.get_u32(),
                    length: cursor.get_u32(),
                }
            }
            MessageId::Port => {
                expect(2)?;
                Message::Port { listen_port: cursor.get_u16() }
            }
        };

        trace!("Decoded {:?} message ({} bytes)", message_id, count);
        Ok(message)
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.message_length());
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }

        buf.to_vec()
    }

    /// Deserialize a complete message (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Self::from_bytes(data, 0, data.len())
    }
}
