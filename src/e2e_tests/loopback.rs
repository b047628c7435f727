//! In-process fake SMB2 server for end-to-end transport tests
//!
//! The server speaks just enough SMB2 framing to exercise the client
//! transport. What it does with a request depends on the request body:
//!
//! * `silent`: never answered directly; the reply is sent late, just before
//!   the reply to the next answered request
//! * `hold`: never answered; once `close_after_held` of them arrived the
//!   server drops the connection
//! * anything else: echoed back, compounded when the request was
//!
//! `ChangeNotify` requests first get an async `STATUS_PENDING` interim reply.

use crate::config::TransportConfig;
use crate::error::{NtStatus, Result};
use crate::netbios::{NetBiosHeader, NetBiosMessage};
use crate::protocol::{Smb2Command, Smb2Header, Smb2HeaderFlags};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

/// Async id the server hands out for the request with message id `mid`
pub fn async_id_for(mid: u64) -> u64 {
    0x1000 + mid
}

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Drop the connection once this many `hold` requests are outstanding
    pub close_after_held: Option<usize>,
    /// Precede every reply frame with a NetBIOS keep-alive
    pub keepalives: bool,
    /// Delay between an interim reply and the final one
    pub pending_delay: Duration,
}

/// A loopback SMB2 peer listening on localhost
pub struct FakeServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = connections.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::AcqRel);
                debug!("Fake server accepted {}", peer);
                let options = options.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, options).await {
                        debug!("Fake server connection ended: {}", e);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connections,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client configuration pointing at this server
    pub fn config(&self) -> TransportConfig {
        TransportConfig::for_addr(self.addr)
    }

    /// Number of accepted connections so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Split an SMB2 frame into its compound elements
fn elements(frame: &[u8]) -> Result<Vec<&[u8]>> {
    let mut elements = Vec::new();
    let mut rest = frame;
    loop {
        let next = Smb2Header::peek_next_command(rest)? as usize;
        if next == 0 {
            elements.push(rest);
            return Ok(elements);
        }
        let (element, tail) = rest.split_at(next);
        elements.push(element);
        rest = tail;
    }
}

fn reply(request: &Smb2Header, status: NtStatus, flags: Smb2HeaderFlags, body: &[u8]) -> Vec<u8> {
    let mut header = Smb2Header::new(request.command);
    header.flags = Smb2HeaderFlags::SERVER_TO_REDIR | flags;
    header.status = status as u32;
    header.message_id = request.message_id;
    header.session_id = request.session_id;
    // grant whatever the client asked for
    header.credit = request.credit.max(1);
    if flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
        header.async_id = async_id_for(request.message_id);
    } else {
        header.tree_id = request.tree_id;
    }
    let mut bytes = header.serialize();
    bytes.extend_from_slice(body);
    bytes
}

/// Wrap reply elements into one NetBIOS session message
fn frame(elements: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    let count = elements.len();
    let mut payload = Vec::new();
    for (i, mut element) in elements.into_iter().enumerate() {
        if i + 1 < count {
            let next = (element.len() + 7) & !7;
            element.resize(next, 0);
            element[Smb2Header::NEXT_COMMAND_OFFSET..Smb2Header::NEXT_COMMAND_OFFSET + 4]
                .copy_from_slice(&(next as u32).to_le_bytes());
        }
        payload.extend_from_slice(&element);
    }
    Ok(NetBiosMessage::session_message(payload)?.to_bytes())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; NetBiosHeader::SIZE];
    if let Err(e) = stream.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }
    let header = NetBiosHeader::parse(&header)?;
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn send_frame(stream: &mut TcpStream, bytes: &[u8], options: &ServerOptions) -> Result<()> {
    if options.keepalives {
        stream.write_all(&NetBiosMessage::keepalive().to_bytes()).await?;
    }
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn serve(mut stream: TcpStream, options: ServerOptions) -> Result<()> {
    let mut late: Vec<Smb2Header> = Vec::new();
    let mut held = 0usize;

    while let Some(request) = read_frame(&mut stream).await? {
        let mut replies = Vec::new();
        let mut pending = Vec::new();

        for element in elements(&request)? {
            let header = Smb2Header::parse(element)?;
            let body = &element[Smb2Header::SIZE..];

            if body.starts_with(b"silent") {
                late.push(header);
            } else if body.starts_with(b"hold") {
                held += 1;
            } else if header.command == Smb2Command::ChangeNotify {
                pending.push((header, body.to_vec()));
            } else {
                replies.push(reply(&header, NtStatus::Success, Smb2HeaderFlags::empty(), body));
            }
        }

        if options.close_after_held.map_or(false, |limit| held >= limit) {
            debug!("Fake server closing after {} held requests", held);
            return Ok(());
        }

        if !replies.is_empty() || !pending.is_empty() {
            for stale in late.drain(..) {
                let bytes = frame(vec![reply(&stale, NtStatus::Success, Smb2HeaderFlags::empty(), b"stale")])?;
                send_frame(&mut stream, &bytes, &options).await?;
            }
        }
        if !replies.is_empty() {
            send_frame(&mut stream, &frame(replies)?, &options).await?;
        }

        for (header, body) in pending {
            let interim = reply(
                &header,
                NtStatus::Pending,
                Smb2HeaderFlags::ASYNC_COMMAND,
                &[],
            );
            send_frame(&mut stream, &frame(vec![interim])?, &options).await?;
            tokio::time::sleep(options.pending_delay).await;

            let done = reply(&header, NtStatus::Success, Smb2HeaderFlags::ASYNC_COMMAND, &body);
            send_frame(&mut stream, &frame(vec![done])?, &options).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_pads_compound_elements() {
        let request = Smb2Header::new(Smb2Command::Create);
        let first = reply(&request, NtStatus::Success, Smb2HeaderFlags::empty(), b"abc");
        let second = reply(&request, NtStatus::Success, Smb2HeaderFlags::empty(), b"d");

        let bytes = frame(vec![first, second]).unwrap();
        let payload = &bytes[NetBiosHeader::SIZE..];
        let split = elements(payload).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].len(), 72);
        assert_eq!(&split[1][Smb2Header::SIZE..], b"d");
    }
}
