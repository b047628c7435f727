//! SMB2 protocol headers

use super::smb2_constants::*;
use crate::error::{Error, NtStatus, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;

/// SMB2 Header structure
///
/// Sync and async headers share one layout; bytes 32..40 hold either
/// `process_id`/`tree_id` or `async_id`, selected by
/// [`Smb2HeaderFlags::ASYNC_COMMAND`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub structure_size: u16,
    pub credit_charge: u16,
    pub status: u32,
    pub command: Smb2Command,
    pub credit: u16,
    pub flags: Smb2HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    pub process_id: u32,
    pub tree_id: u32,
    pub async_id: u64,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Default for Smb2Header {
    fn default() -> Self {
        Self::new(Smb2Command::Negotiate)
    }
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;

    /// Offset of the message id within the header
    pub const MESSAGE_ID_OFFSET: usize = 24;

    /// Offset of the next-command field within the header
    pub const NEXT_COMMAND_OFFSET: usize = 20;

    /// Offset of the credit request/response field
    pub const CREDIT_OFFSET: usize = 14;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            structure_size: 64,
            credit_charge: 0,
            status: 0,
            command,
            credit: 1,
            flags: Smb2HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            process_id: 0,
            tree_id: 0,
            async_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::ASYNC_COMMAND)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SERVER_TO_REDIR)
    }

    /// The status as a known NT status, if it is one
    pub fn nt_status(&self) -> Option<NtStatus> {
        NtStatus::try_from(self.status).ok()
    }

    /// Read the message id of the header at the start of `buf`
    pub fn peek_message_id(buf: &[u8]) -> Result<u64> {
        Self::check_frame(buf)?;
        Ok(LittleEndian::read_u64(
            &buf[Self::MESSAGE_ID_OFFSET..Self::MESSAGE_ID_OFFSET + 8],
        ))
    }

    /// Read the next-command offset of the header at the start of `buf`
    pub fn peek_next_command(buf: &[u8]) -> Result<u32> {
        Self::check_frame(buf)?;
        Ok(LittleEndian::read_u32(
            &buf[Self::NEXT_COMMAND_OFFSET..Self::NEXT_COMMAND_OFFSET + 4],
        ))
    }

    fn check_frame(buf: &[u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        if buf[0..4] != SMB2_MAGIC {
            return Err(Error::InvalidHeader("Invalid SMB2 magic".into()));
        }
        Ok(())
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        Self::check_frame(buf)?;

        let structure_size = LittleEndian::read_u16(&buf[4..6]);
        if structure_size != 64 {
            return Err(Error::InvalidHeader(format!(
                "Invalid SMB2 header structure size: {}",
                structure_size
            )));
        }

        let flags = Smb2HeaderFlags::from_bits_retain(LittleEndian::read_u32(&buf[16..20]));
        let (process_id, tree_id, async_id) = if flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
            (0, 0, LittleEndian::read_u64(&buf[32..40]))
        } else {
            (
                LittleEndian::read_u32(&buf[32..36]),
                LittleEndian::read_u32(&buf[36..40]),
                0,
            )
        };

        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[48..64]);

        Ok(Self {
            structure_size,
            credit_charge: LittleEndian::read_u16(&buf[6..8]),
            status: LittleEndian::read_u32(&buf[8..12]),
            command: Smb2Command::try_from(LittleEndian::read_u16(&buf[12..14]))?,
            credit: LittleEndian::read_u16(&buf[14..16]),
            flags,
            next_command: LittleEndian::read_u32(&buf[20..24]),
            message_id: LittleEndian::read_u64(&buf[24..32]),
            process_id,
            tree_id,
            async_id,
            session_id: LittleEndian::read_u64(&buf[40..48]),
            signature,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        // writes into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    pub fn write_to<W: Write>(&self, buf: &mut W) -> Result<()> {
        // Protocol ID: 0xFE 'S' 'M' 'B'
        buf.write_all(&SMB2_MAGIC)?;
        buf.write_u16::<LittleEndian>(self.structure_size)?;
        buf.write_u16::<LittleEndian>(self.credit_charge)?;
        buf.write_u32::<LittleEndian>(self.status)?;
        buf.write_u16::<LittleEndian>(self.command as u16)?;
        buf.write_u16::<LittleEndian>(self.credit)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_u32::<LittleEndian>(self.next_command)?;
        buf.write_u64::<LittleEndian>(self.message_id)?;
        if self.is_async() {
            buf.write_u64::<LittleEndian>(self.async_id)?;
        } else {
            buf.write_u32::<LittleEndian>(self.process_id)?;
            buf.write_u32::<LittleEndian>(self.tree_id)?;
        }
        buf.write_u64::<LittleEndian>(self.session_id)?;
        buf.write_all(&self.signature)?;
        Ok(())
    }
}
