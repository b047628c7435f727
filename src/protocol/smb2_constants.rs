//! SMB2/3 protocol constants

use bitflags::bitflags;

/// SMB2 magic as bytes
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// SMB2 magic as u32
pub const SMB2_MAGIC_U32: u32 = 0x424D53FE;

/// SMB2 header size
pub const SMB2_HEADER_SIZE: usize = 64;

/// Compound elements start on 8-byte boundaries
pub const SMB2_COMPOUND_ALIGNMENT: usize = 8;

/// Message id the server uses for unsolicited oplock breaks
pub const SMB2_OPLOCK_BREAK_MID: u64 = u64::MAX;

/// SMB2 Commands (opcodes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Smb2Command {
    #[default]
    Negotiate = 0x00,
    SessionSetup = 0x01,
    Logoff = 0x02,
    TreeConnect = 0x03,
    TreeDisconnect = 0x04,
    Create = 0x05,
    Close = 0x06,
    Flush = 0x07,
    Read = 0x08,
    Write = 0x09,
    Lock = 0x0A,
    Ioctl = 0x0B,
    Cancel = 0x0C,
    Echo = 0x0D,
    QueryDirectory = 0x0E,
    ChangeNotify = 0x0F,
    QueryInfo = 0x10,
    SetInfo = 0x11,
    OplockBreak = 0x12,
}

impl TryFrom<u16> for Smb2Command {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Negotiate),
            0x01 => Ok(Self::SessionSetup),
            0x02 => Ok(Self::Logoff),
            0x03 => Ok(Self::TreeConnect),
            0x04 => Ok(Self::TreeDisconnect),
            0x05 => Ok(Self::Create),
            0x06 => Ok(Self::Close),
            0x07 => Ok(Self::Flush),
            0x08 => Ok(Self::Read),
            0x09 => Ok(Self::Write),
            0x0A => Ok(Self::Lock),
            0x0B => Ok(Self::Ioctl),
            0x0C => Ok(Self::Cancel),
            0x0D => Ok(Self::Echo),
            0x0E => Ok(Self::QueryDirectory),
            0x0F => Ok(Self::ChangeNotify),
            0x10 => Ok(Self::QueryInfo),
            0x11 => Ok(Self::SetInfo),
            0x12 => Ok(Self::OplockBreak),
            _ => Err(crate::Error::InvalidHeader(format!(
                "Invalid SMB2 command: 0x{:04x}",
                value
            ))),
        }
    }
}

bitflags! {
    /// SMB2 header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Smb2HeaderFlags: u32 {
        const SERVER_TO_REDIR = 0x00000001;
        const ASYNC_COMMAND = 0x00000002;
        const RELATED_OPERATIONS = 0x00000004;
        const SIGNED = 0x00000008;
        const DFS_OPERATIONS = 0x10000000;
        const REPLAY_OPERATION = 0x20000000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smb2_magic() {
        assert_eq!(SMB2_MAGIC, [0xFE, b'S', b'M', b'B']);
        assert_eq!(SMB2_MAGIC_U32, u32::from_le_bytes(SMB2_MAGIC));
    }

    #[test]
    fn test_smb2_commands() {
        assert_eq!(Smb2Command::Negotiate as u16, 0x00);
        assert_eq!(Smb2Command::Create as u16, 0x05);
        assert_eq!(Smb2Command::try_from(0x12).unwrap(), Smb2Command::OplockBreak);
        assert!(Smb2Command::try_from(0x13).is_err());
    }

    #[test]
    fn test_header_flags_keep_unknown_bits() {
        let flags = Smb2HeaderFlags::from_bits_retain(0x8000_0003);
        assert!(flags.contains(Smb2HeaderFlags::SERVER_TO_REDIR | Smb2HeaderFlags::ASYNC_COMMAND));
        assert_eq!(flags.bits(), 0x8000_0003);
    }
}
