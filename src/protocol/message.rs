//! SMB2 request and response envelopes
//!
//! The transport does not interpret command bodies; an envelope is a parsed
//! header plus the opaque body that follows it.

use super::header::Smb2Header;
use super::smb2_constants::{Smb2Command, Smb2HeaderFlags};
use crate::error::{NtStatus, Result};
use crate::message::{Message, Request, Response};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Outbound SMB2 message
#[derive(Debug, Clone, Default)]
pub struct Smb2Request {
    pub header: Smb2Header,
    pub body: Bytes,
    /// Overrides the configured response timeout for this request
    pub response_timeout: Option<Duration>,
}

impl Smb2Request {
    pub fn new(command: Smb2Command, body: impl Into<Bytes>) -> Self {
        Self {
            header: Smb2Header::new(command),
            body: body.into(),
            response_timeout: None,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_session(mut self, session_id: u64, tree_id: u32) -> Self {
        self.header.session_id = session_id;
        self.header.tree_id = tree_id;
        self
    }

    /// Mark this request as following the previous one of a compound
    pub fn related(mut self) -> Self {
        self.header.flags |= Smb2HeaderFlags::RELATED_OPERATIONS;
        self
    }

    pub fn command(&self) -> Smb2Command {
        self.header.command
    }

    pub fn encoded_len(&self) -> usize {
        Smb2Header::SIZE + self.body.len()
    }

    /// Append header and body, with `next_command` patched in
    pub fn encode_to(&self, buf: &mut BytesMut, next_command: u32) -> Result<()> {
        let mut header = self.header.clone();
        header.next_command = next_command;
        header.write_to(&mut (&mut *buf).writer())?;
        buf.put_slice(&self.body);
        Ok(())
    }
}

impl Message for Smb2Request {
    fn mid(&self) -> u64 {
        self.header.message_id
    }
}

impl Request for Smb2Request {
    fn set_mid(&mut self, mid: u64) {
        self.header.message_id = mid;
    }
}

/// Inbound SMB2 message
#[derive(Debug, Clone, Default)]
pub struct Smb2Response {
    pub header: Smb2Header,
    pub body: Bytes,
    async_handled: bool,
}

impl Smb2Response {
    pub fn status(&self) -> Option<NtStatus> {
        self.header.nt_status()
    }

    pub fn is_async_handled(&self) -> bool {
        self.async_handled
    }

    pub(crate) fn mark_async_handled(&mut self) {
        self.async_handled = true;
    }
}

impl Message for Smb2Response {
    fn mid(&self) -> u64 {
        self.header.message_id
    }
}

impl Response for Smb2Response {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn decode(&mut self, payload: &[u8]) -> Result<()> {
        self.header = Smb2Header::parse(payload)?;
        self.body = Bytes::copy_from_slice(&payload[Smb2Header::SIZE..]);
        Ok(())
    }

    fn is_interim(&self) -> bool {
        self.header.is_async() && self.header.status == NtStatus::Pending as u32
    }

    fn credit(&self) -> u16 {
        self.header.credit
    }

    fn error_code(&self) -> u32 {
        self.header.status
    }
}
