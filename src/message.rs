//! Message contracts between protocol layers and the transport
//!
//! A protocol binding supplies concrete [`Request`] and [`Response`] types.
//! The transport wraps every response body in a [`Reply`], which carries the
//! bookkeeping the correlation protocol needs (received/error flags, mid,
//! expiration, retained payload) and the completion signal a waiting caller
//! sleeps on. A [`Chain`] is one compound wire exchange: requests and their
//! replies in transmission order.

use crate::error::{Error, Result};
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

bitflags! {
    /// Per-call options for [`Transport::sendrecv`](crate::transport::Transport::sendrecv)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestParams: u8 {
        /// Wait for the reply without a deadline
        const NO_TIMEOUT     = 0x01;
        /// Keep the raw reply bytes on the [`Reply`]
        const RETAIN_PAYLOAD = 0x02;
    }
}

/// Anything carrying a correlation key
pub trait Message {
    /// The correlation key ("mid") of this message
    fn mid(&self) -> u64;
}

/// Outbound protocol message
pub trait Request: Message + Send + Sync + 'static {
    /// Stamp the correlation key the reply will carry
    fn set_mid(&mut self, mid: u64);
}

/// Inbound protocol message body
pub trait Response: Send + 'static {
    /// Clear decoded state before the response is (re)used for an exchange
    fn reset(&mut self);

    /// Decode one complete inbound message
    fn decode(&mut self, payload: &[u8]) -> Result<()>;

    /// An interim reply ("still processing"); the exchange is not complete
    fn is_interim(&self) -> bool {
        false
    }

    /// Credits granted by the peer
    fn credit(&self) -> u16 {
        0
    }

    /// Protocol status code
    fn error_code(&self) -> u32 {
        0
    }
}

struct ReplyState<R> {
    body: R,
    received: bool,
    error: Option<Arc<Error>>,
    mid: u64,
    expiration: Option<Instant>,
    retain_payload: bool,
    raw: Option<Bytes>,
}

/// A response body plus the transport's bookkeeping for it
pub struct Reply<R> {
    state: Mutex<ReplyState<R>>,
    signal: Notify,
}

impl<R: Response> Reply<R> {
    pub fn new(body: R) -> Self {
        Self {
            state: Mutex::new(ReplyState {
                body,
                received: false,
                error: None,
                mid: 0,
                expiration: None,
                retain_payload: false,
                raw: None,
            }),
            signal: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplyState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepare for a new exchange
    pub(crate) fn reset(&self, retain_payload: bool) {
        let mut state = self.state();
        state.body.reset();
        state.received = false;
        state.error = None;
        state.raw = None;
        state.retain_payload = retain_payload;
    }

    pub(crate) fn set_mid(&self, mid: u64) {
        self.state().mid = mid;
    }

    pub fn is_received(&self) -> bool {
        self.state().received
    }

    pub fn is_error(&self) -> bool {
        self.state().error.is_some()
    }

    /// The failure captured for this reply, if any
    pub fn error(&self) -> Option<Arc<Error>> {
        self.state().error.clone()
    }

    /// Absolute deadline; `None` means wait forever
    pub fn expiration(&self) -> Option<Instant> {
        self.state().expiration
    }

    pub fn set_expiration(&self, expiration: Option<Instant>) {
        self.state().expiration = expiration;
    }

    pub fn credit(&self) -> u16 {
        self.state().body.credit()
    }

    pub fn error_code(&self) -> u32 {
        self.state().body.error_code()
    }

    /// Raw bytes of the last delivery, kept only with `RETAIN_PAYLOAD`
    pub fn raw_payload(&self) -> Option<Bytes> {
        self.state().raw.clone()
    }

    pub fn with_body<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&self.state().body)
    }

    pub fn with_body_mut<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut self.state().body)
    }

    /// Move the decoded body out, leaving a default one behind
    pub fn take_body(&self) -> R
    where
        R: Default,
    {
        std::mem::take(&mut self.state().body)
    }

    /// Decode an inbound message into this reply and wake its waiter.
    ///
    /// Returns whether the reply is now complete. Interim replies wake the
    /// waiter without completing. A reply completes at most once; later
    /// deliveries are ignored.
    pub(crate) fn deliver(&self, payload: Bytes) -> Result<bool> {
        let mut state = self.state();
        if state.received {
            tracing::trace!("Ignoring duplicate delivery for mid {}", state.mid);
            return Ok(false);
        }

        if let Err(e) = state.body.decode(&payload) {
            let cause = Arc::new(e);
            state.error = Some(cause.clone());
            drop(state);
            self.signal.notify_waiters();
            return Err(Error::transport_caused_by(
                "failure decoding message",
                cause,
            ));
        }

        if state.retain_payload {
            state.raw = Some(payload);
        }

        let complete = !state.body.is_interim();
        if complete {
            state.received = true;
        }
        drop(state);

        self.signal.notify_waiters();
        Ok(complete)
    }

    /// Record a failure observed by the receive worker and wake the waiter
    pub(crate) fn fail(&self, cause: Arc<Error>) {
        self.state().error = Some(cause);
        self.signal.notify_waiters();
    }

    /// Wake the waiter so it re-evaluates its deadline
    pub(crate) fn wake(&self) {
        self.signal.notify_waiters();
    }

    /// Completion signal; enable it before checking state to avoid lost wakeups
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.signal.notified()
    }
}

impl<R: Response> Message for Reply<R> {
    fn mid(&self) -> u64 {
        self.state().mid
    }
}

/// One compound wire exchange: requests and their replies, head first
pub struct Chain<Q, R> {
    requests: Vec<Q>,
    replies: Vec<Arc<Reply<R>>>,
}

impl<Q: Request, R: Response> Chain<Q, R> {
    /// A chain with a single exchange
    pub fn new(request: Q, response: R) -> Self {
        Self {
            requests: vec![request],
            replies: vec![Arc::new(Reply::new(response))],
        }
    }

    /// Append the next exchange of a compound request
    pub fn then(mut self, request: Q, response: R) -> Self {
        self.push(request, response);
        self
    }

    pub fn push(&mut self, request: Q, response: R) {
        self.requests.push(request);
        self.replies.push(Arc::new(Reply::new(response)));
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn head(&self) -> &Q {
        &self.requests[0]
    }

    pub fn requests(&self) -> &[Q] {
        &self.requests
    }

    pub fn replies(&self) -> &[Arc<Reply<R>>] {
        &self.replies
    }

    pub fn reply(&self, index: usize) -> Option<&Arc<Reply<R>>> {
        self.replies.get(index)
    }

    pub(crate) fn links_mut(&mut self) -> impl Iterator<Item = (&mut Q, &Arc<Reply<R>>)> {
        self.requests.iter_mut().zip(self.replies.iter())
    }

    /// The decoded bodies, in chain order
    pub fn into_bodies(self) -> Vec<R>
    where
        R: Default,
    {
        self.replies.iter().map(|reply| reply.take_body()).collect()
    }
}
