//! SMB2 over direct TCP (port 445)

use super::Binding;
use crate::config::TransportConfig;
use crate::error::{Error, NtStatus, Result};
use crate::message::{Message, Reply, Response};
use crate::netbios::{NetBiosHeader, NetBiosMessageType};
use crate::protocol::smb2_constants::{
    Smb2Command, SMB2_COMPOUND_ALIGNMENT, SMB2_MAGIC, SMB2_OPLOCK_BREAK_MID,
};
use crate::protocol::{Smb2Header, Smb2Request, Smb2Response};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct Reader {
    stream: Option<OwnedReadHalf>,
    read_buffer: BytesMut,
    /// Unconsumed elements of the current compound frame
    frame: Option<Bytes>,
}

impl Reader {
    fn new() -> Self {
        Self {
            stream: None,
            read_buffer: BytesMut::with_capacity(65536),
            frame: None,
        }
    }

    /// Buffer at least `needed` bytes. `false` means a clean end of stream.
    async fn fill(&mut self, needed: usize) -> Result<bool> {
        while self.read_buffer.len() < needed {
            let stream = self.stream.as_mut().ok_or_else(not_connected)?;
            self.read_buffer.reserve(needed - self.read_buffer.len());
            let n = stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(false);
                }
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(true)
    }

    /// Read the next SMB2 frame, dodging keep-alives
    async fn next_frame(&mut self, max_size: usize) -> Result<Option<Bytes>> {
        loop {
            if !self.fill(NetBiosHeader::SIZE).await? {
                return Ok(None);
            }
            let header = NetBiosHeader::parse(&self.read_buffer[..NetBiosHeader::SIZE])?;
            let length = header.length as usize;

            if header.is_keepalive() {
                trace!("Skipping NetBIOS keep-alive");
                if !self.fill(NetBiosHeader::SIZE + length).await? {
                    return Err(Error::ConnectionClosed);
                }
                self.read_buffer.advance(NetBiosHeader::SIZE + length);
                continue;
            }
            if header.message_type != NetBiosMessageType::SessionMessage {
                return Err(Error::Protocol(format!(
                    "Unexpected NetBIOS message type: {:?}",
                    header.message_type
                )));
            }
            if length > max_size {
                return Err(Error::Protocol(format!("Invalid payload size: {}", length)));
            }
            if length < Smb2Header::SIZE {
                return Err(Error::Protocol(format!("Frame of {} bytes is too short", length)));
            }

            if !self.fill(NetBiosHeader::SIZE + length).await? {
                return Err(Error::ConnectionClosed);
            }
            self.read_buffer.advance(NetBiosHeader::SIZE);
            let frame = self.read_buffer.split_to(length).freeze();
            if frame[0..4] != SMB2_MAGIC {
                return Err(Error::Protocol("Stream is out of sync".into()));
            }
            return Ok(Some(frame));
        }
    }

    /// Detach the element at the head of the current frame
    fn take_element(&mut self, key: u64) -> Result<Bytes> {
        let Some(mut frame) = self.frame.take() else {
            return Err(Error::Protocol(format!("No message peeked for mid {}", key)));
        };

        let mid = Smb2Header::peek_message_id(&frame)?;
        if mid != key {
            return Err(Error::Protocol(format!(
                "Peeked mid {} but was asked for {}",
                mid, key
            )));
        }

        let next = Smb2Header::peek_next_command(&frame)? as usize;
        if next == 0 {
            return Ok(frame);
        }
        if next < Smb2Header::SIZE || next >= frame.len() {
            return Err(Error::Protocol(format!("Invalid next command offset {}", next)));
        }
        let element = frame.split_to(next);
        self.frame = Some(frame);
        Ok(element)
    }
}

fn not_connected() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotConnected, "Not connected"))
}

fn align(len: usize) -> usize {
    (len + SMB2_COMPOUND_ALIGNMENT - 1) & !(SMB2_COMPOUND_ALIGNMENT - 1)
}

/// Credits a request consumes; requests without a charge cost one
fn credit_cost(request: &Smb2Request) -> u32 {
    u32::from(request.header.credit_charge.max(1))
}

fn closed_window() -> Arc<Semaphore> {
    let credits = Semaphore::new(0);
    credits.close();
    Arc::new(credits)
}

/// SMB2 binding for a [`Transport`](super::Transport) over one TCP connection
pub struct TcpBinding {
    config: TransportConfig,
    reader: Mutex<Reader>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    addrs: SyncMutex<Option<(SocketAddr, SocketAddr)>>,
    next_mid: AtomicU64,
    /// Credit window of the current connection; closed while disconnected
    credits: SyncMutex<Arc<Semaphore>>,
}

impl TcpBinding {
    /// Create a binding; `config.remote_addr` must be set before connecting
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(Reader::new()),
            writer: Mutex::new(None),
            addrs: SyncMutex::new(None),
            next_mid: AtomicU64::new(0),
            credits: SyncMutex::new(closed_window()),
        }
    }

    fn credits(&self) -> Arc<Semaphore> {
        self.credits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Credits currently available for sending
    pub fn available_credits(&self) -> usize {
        self.credits().available_permits()
    }

    /// Take the credits a request chain costs, waiting at most the head
    /// request's response timeout. Returns the number of credits to ask the
    /// server for.
    async fn acquire_credits(&self, requests: &[Smb2Request]) -> Result<u16> {
        let Some(head) = requests.first() else {
            return Err(Error::InvalidParameter("empty request chain".into()));
        };
        let cost: u32 = requests.iter().map(credit_cost).sum();
        let credits = self.credits();
        trace!(
            "Chain of {} costs {} credits, {} available",
            requests.len(),
            cost,
            credits.available_permits()
        );

        let acquire = credits.acquire_many(cost);
        let permit = match self.response_timeout(head) {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                Error::RequestTimeout(format!("Failed to acquire {} credits in time", cost))
            })?,
            None => acquire.await,
        }
        .map_err(|_| not_connected())?;
        permit.forget();

        let wanted = usize::from(self.config.desired_credits)
            .saturating_sub(credits.available_permits() + requests.len() - 1)
            .max(1);
        Ok(u16::try_from(wanted).unwrap_or(u16::MAX))
    }

    /// Return the credits granted by an inbound message to the window
    fn grant_credits(&self, element: &[u8]) -> Result<()> {
        let header = Smb2Header::parse(element)?;
        let interim = header.status == NtStatus::Pending as u32;
        if header.is_async() && !interim {
            // granted with the interim reply already
            return Ok(());
        }

        let credits = self.credits();
        if header.credit > 0 {
            trace!("Adding {} credits", header.credit);
            credits.add_permits(usize::from(header.credit));
        } else if header.message_id != SMB2_OPLOCK_BREAK_MID
            && header.status == NtStatus::Success as u32
        {
            if credits.available_permits() > 0 {
                debug!("Server returned zero credits for mid {}", header.message_id);
            } else {
                warn!("Server took away all our credits");
            }
        }
        Ok(())
    }

    fn addrs(&self) -> MutexGuard<'_, Option<(SocketAddr, SocketAddr)>> {
        self.addrs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addrs = *self.addrs();
        addrs.map(|(local, _)| local).ok_or_else(not_connected)
    }

    pub fn remote_addr(&self) -> Result<SocketAddr> {
        let addrs = *self.addrs();
        addrs.map(|(_, remote)| remote).ok_or_else(not_connected)
    }

    /// Encode a request chain as one NetBIOS session message
    fn encode(&self, requests: &[Smb2Request]) -> Result<BytesMut> {
        let mut payload = BytesMut::new();
        for (i, request) in requests.iter().enumerate() {
            let start = payload.len();
            if i + 1 == requests.len() {
                request.encode_to(&mut payload, 0)?;
            } else {
                let next = align(request.encoded_len());
                request.encode_to(&mut payload, next as u32)?;
                payload.resize(start + next, 0);
            }
        }

        if payload.len() > self.config.max_buffer_size {
            return Err(Error::InvalidParameter(format!(
                "Message of {} bytes exceeds the maximum buffer size {}",
                payload.len(),
                self.config.max_buffer_size
            )));
        }
        let length = u32::try_from(payload.len()).map_err(|_| {
            Error::InvalidParameter(format!("Message of {} bytes", payload.len()))
        })?;

        let mut frame = BytesMut::with_capacity(NetBiosHeader::SIZE + payload.len());
        NetBiosHeader::session_message(length)?.write_to(&mut frame)?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

#[async_trait]
impl Binding for TcpBinding {
    type Request = Smb2Request;
    type Response = Smb2Response;

    fn make_key(&self, request: &mut Smb2Request) -> Result<u64> {
        let mid = self.next_mid.fetch_add(1, Ordering::AcqRel);
        request.header.message_id = mid;
        Ok(mid)
    }

    async fn peek_key(&self) -> Result<Option<u64>> {
        let mut reader = self.reader.lock().await;
        if let Some(frame) = &reader.frame {
            return Smb2Header::peek_message_id(frame).map(Some);
        }

        match reader.next_frame(self.config.max_buffer_size).await? {
            Some(frame) => {
                let mid = Smb2Header::peek_message_id(&frame)?;
                reader.frame = Some(frame);
                Ok(Some(mid))
            }
            None => Ok(None),
        }
    }

    async fn do_send(&self, requests: &[Smb2Request]) -> Result<()> {
        let mut frame = self.encode(requests)?;
        let credit_request = self.acquire_credits(requests).await?;
        let offset = NetBiosHeader::SIZE + Smb2Header::CREDIT_OFFSET;
        frame[offset..offset + 2].copy_from_slice(&credit_request.to_le_bytes());

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(not_connected)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn do_recv(&self, key: u64) -> Result<Bytes> {
        let element = self.reader.lock().await.take_element(key)?;
        self.grant_credits(&element)?;
        Ok(element)
    }

    async fn do_skip(&self, key: u64) -> Result<()> {
        let element = self.reader.lock().await.take_element(key)?;
        // a late reply still carries the credits of its request
        self.grant_credits(&element)?;
        if key == SMB2_OPLOCK_BREAK_MID {
            let command = Smb2Header::parse(&element).map(|header| header.command);
            if matches!(command, Ok(Smb2Command::OplockBreak)) {
                debug!("Received oplock break notification");
                return Ok(());
            }
        }
        debug!("Skipped message {} ({} bytes)", key, element.len());
        Ok(())
    }

    async fn do_connect(&self) -> Result<()> {
        let addr = self
            .config
            .remote_addr
            .ok_or_else(|| Error::InvalidParameter("No remote address configured".into()))?;

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(Error::ConnectionTimeout(format!(
                    "Connecting to {} timed out",
                    addr
                )))
            }
        };
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        {
            let mut reader = self.reader.lock().await;
            reader.stream = Some(read_half);
            reader.read_buffer.clear();
            reader.frame = None;
        }
        *self.writer.lock().await = Some(write_half);
        *self.addrs() = Some((local, remote));
        self.next_mid.store(0, Ordering::Release);
        // a fresh connection starts out with a single credit
        *self.credits.lock().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Semaphore::new(1));

        debug!("Connected to {} from {}", remote, local);
        Ok(())
    }

    async fn do_disconnect(&self, hard: bool, _in_use: bool) -> Result<bool> {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if !hard {
                if let Err(e) = writer.shutdown().await {
                    debug!("Failed to shut down the connection: {}", e);
                }
            }
        }
        // the receive worker may be parked in a read; the next connect
        // replaces the read half in that case
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.stream = None;
            reader.frame = None;
            reader.read_buffer.clear();
        }
        *self.addrs() = None;
        // senders waiting for credits fail with "not connected"
        self.credits().close();
        Ok(false)
    }

    fn response_timeout(&self, request: &Smb2Request) -> Option<Duration> {
        request
            .response_timeout
            .or_else(|| self.config.response_timeout())
            .filter(|timeout| !timeout.is_zero())
    }

    fn handle_intermediate(&self, request: &mut Smb2Request, reply: &Reply<Smb2Response>) -> bool {
        let async_id = reply.with_body_mut(|response| {
            if response.is_interim() && !response.is_async_handled() {
                response.mark_async_handled();
                Some(response.header.async_id)
            } else {
                None
            }
        });
        let Some(async_id) = async_id else {
            return false;
        };

        debug!(
            "Received STATUS_PENDING for mid {}, async id {}",
            request.mid(),
            async_id
        );
        request.header.async_id = async_id;
        // an unbounded wait stays unbounded
        if reply.expiration().is_some() {
            reply.set_expiration(
                self.response_timeout(request)
                    .map(|timeout| Instant::now() + timeout),
            );
        }
        true
    }
}
