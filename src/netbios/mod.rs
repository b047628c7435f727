//! NetBIOS session service framing (RFC 1002) as used by direct-hosted SMB
//!
//! Every SMB2 message on the wire is preceded by a 4-byte header: one type
//! byte and a 24-bit big-endian length. Keep-alives carry no payload.

use crate::error::{Error, Result};
use bytes::BufMut;
use std::convert::TryFrom;

/// Session service packet types; direct-hosted SMB only sees the first and
/// the last
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetBiosMessageType {
    SessionMessage = 0x00,
    SessionRequest = 0x81,
    PositiveResponse = 0x82,
    NegativeResponse = 0x83,
    RetargetResponse = 0x84,
    Keepalive = 0x85,
}

impl TryFrom<u8> for NetBiosMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Self::SessionMessage,
            0x81 => Self::SessionRequest,
            0x82 => Self::PositiveResponse,
            0x83 => Self::NegativeResponse,
            0x84 => Self::RetargetResponse,
            0x85 => Self::Keepalive,
            other => {
                return Err(Error::Protocol(format!(
                    "Invalid NetBIOS message type: 0x{:02x}",
                    other
                )))
            }
        })
    }
}

/// NetBIOS Session Service header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetBiosHeader {
    /// Message type
    pub message_type: NetBiosMessageType,
    /// Length of the message payload (24 bits max)
    pub length: u32,
}

impl NetBiosHeader {
    /// Maximum payload length (24 bits)
    pub const MAX_LENGTH: u32 = 0xFF_FFFF;

    /// Header size in bytes
    pub const SIZE: usize = 4;

    /// Create a new NetBIOS header
    pub fn new(message_type: NetBiosMessageType, length: u32) -> Result<Self> {
        if length > Self::MAX_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "NetBIOS length {} exceeds maximum {}",
                length,
                Self::MAX_LENGTH
            )));
        }
        Ok(Self {
            message_type,
            length,
        })
    }

    /// Create a session message header
    pub fn session_message(length: u32) -> Result<Self> {
        Self::new(NetBiosMessageType::SessionMessage, length)
    }

    /// Parse a NetBIOS header from bytes
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }

        let message_type = NetBiosMessageType::try_from(buf[0])?;
        let length = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | (buf[3] as u32);

        Ok(Self {
            message_type,
            length,
        })
    }

    pub fn is_keepalive(&self) -> bool {
        self.message_type == NetBiosMessageType::Keepalive
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0] = self.message_type as u8;
        bytes[1] = ((self.length >> 16) & 0xFF) as u8;
        bytes[2] = ((self.length >> 8) & 0xFF) as u8;
        bytes[3] = (self.length & 0xFF) as u8;
        bytes
    }

    /// Write the header to a buffer
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if buf.remaining_mut() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.remaining_mut(),
            });
        }
        buf.put_slice(&self.to_bytes());
        Ok(())
    }
}

/// NetBIOS session message wrapper
pub struct NetBiosMessage {
    pub header: NetBiosHeader,
    pub payload: Vec<u8>,
}

impl NetBiosMessage {
    /// Create a new session message
    pub fn session_message(payload: Vec<u8>) -> Result<Self> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            Error::InvalidParameter(format!("NetBIOS payload of {} bytes", payload.len()))
        })?;
        let header = NetBiosHeader::session_message(length)?;
        Ok(Self { header, payload })
    }

    /// Create a keepalive message
    pub fn keepalive() -> Self {
        Self {
            header: NetBiosHeader {
                message_type: NetBiosMessageType::Keepalive,
                length: 0,
            },
            payload: Vec::new(),
        }
    }

    /// Serialize the entire message to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NetBiosHeader::SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a complete NetBIOS message from bytes
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = NetBiosHeader::parse(buf)?;

        let total_len = NetBiosHeader::SIZE + header.length as usize;
        if buf.len() < total_len {
            return Err(Error::BufferTooSmall {
                need: total_len,
                have: buf.len(),
            });
        }

        let payload = buf[NetBiosHeader::SIZE..total_len].to_vec();
        Ok(Self { header, payload })
    }
}
