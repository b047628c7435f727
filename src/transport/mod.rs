//! Multiplexed transport layer
//!
//! One [`Transport`] owns one physical byte stream and serves any number of
//! concurrent request/response exchanges over it. Callers register their
//! replies in a correlation table before sending; a background receive
//! worker peeks the correlation key of every inbound message and delivers it
//! to the matching reply. Everything protocol specific (keys, framing,
//! socket handling) lives behind the [`Binding`] trait.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::message::{Chain, Message, Reply, Request, RequestParams, Response};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

pub mod state;
pub mod tcp;
mod table;
mod worker;

pub use state::{ConnectionState, StateEvent};
use state::StateCell;
use table::{Registration, ResponseTable};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(0);

/// Protocol hooks a concrete transport supplies
#[async_trait]
pub trait Binding: Send + Sync + 'static {
    type Request: Request;
    type Response: Response;

    /// Correlation key the reply to `request` will carry; unique among
    /// outstanding requests
    fn make_key(&self, request: &mut Self::Request) -> Result<u64>;

    /// Key of the next inbound message without consuming its body.
    /// `None` signals end of stream. Must be cancel-safe.
    async fn peek_key(&self) -> Result<Option<u64>>;

    /// Serialize and transmit a request chain as one wire unit
    async fn do_send(&self, requests: &[Self::Request]) -> Result<()>;

    /// Receive the message identified by the last `peek_key`
    async fn do_recv(&self, key: u64) -> Result<Bytes>;

    /// Discard the message identified by the last `peek_key`
    async fn do_skip(&self, key: u64) -> Result<()>;

    /// Establish the underlying stream
    async fn do_connect(&self) -> Result<()>;

    /// Tear the stream down. A hard disconnect must not wait for outstanding
    /// requests. Returns whether the connection was still in use.
    async fn do_disconnect(&self, hard: bool, in_use: bool) -> Result<bool>;

    /// Reply timeout for `request`; `None` waits forever
    fn response_timeout(&self, request: &Self::Request) -> Option<Duration>;

    /// Recognize an interim reply the caller must keep waiting past
    fn handle_intermediate(
        &self,
        _request: &mut Self::Request,
        _reply: &Reply<Self::Response>,
    ) -> bool {
        false
    }
}

struct Handshake {
    generation: u64,
    error: Option<Arc<Error>>,
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<JoinHandle<()>>,
    handshake: Option<oneshot::Receiver<()>>,
}

pub(crate) struct Inner<B: Binding> {
    id: u64,
    name: String,
    binding: B,
    config: TransportConfig,
    state: StateCell,
    table: ResponseTable<B::Response>,
    usage: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
    /// Abort handle of the current worker, reachable without the lifecycle lock
    worker_abort: SyncMutex<Option<AbortHandle>>,
    handshake: SyncMutex<Handshake>,
    input: Mutex<()>,
}

/// A shared, reference-counted connection
///
/// Share it behind an `Arc`; every holder calls [`acquire`](Self::acquire)
/// once and [`release`](Self::release) once (the creator's hold is implicit).
pub struct Transport<B: Binding> {
    inner: Arc<Inner<B>>,
}

impl<B: Binding> Transport<B> {
    pub fn new(binding: B, config: TransportConfig) -> Self {
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("Transport{}", id));

        Self {
            inner: Arc::new(Inner {
                id,
                name,
                binding,
                config,
                state: StateCell::new(),
                table: ResponseTable::new(),
                usage: AtomicUsize::new(1),
                lifecycle: Mutex::new(Lifecycle::default()),
                worker_abort: SyncMutex::new(None),
                handshake: SyncMutex::new(Handshake {
                    generation: 0,
                    error: None,
                }),
                input: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn binding(&self) -> &B {
        &self.inner.binding
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.state.get().is_disconnected()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.state.get().is_failed()
    }

    /// Number of live holders
    pub fn usage_count(&self) -> usize {
        self.inner.usage.load(Ordering::Acquire)
    }

    /// Number of requests currently awaiting a reply
    pub fn pending(&self) -> usize {
        self.inner.table.len()
    }

    /// Register a new holder; returns the new usage count
    pub fn acquire(&self) -> usize {
        let usage = self.inner.usage.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Acquire transport {} {}", usage, self.inner.name);
        usage
    }

    /// Drop a hold. Never tears the connection down by itself.
    pub fn release(&self) -> Result<usize> {
        let previous = self
            .inner
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                usage.checked_sub(1)
            })
            .map_err(|_| Error::UsageUnderflow)?;

        let usage = previous - 1;
        trace!("Release transport {} {}", usage, self.inner.name);
        if usage == 0 {
            trace!("Transport usage dropped to zero {}", self.inner.name);
        }
        Ok(usage)
    }

    /// Connect within the configured connect timeout
    pub async fn ensure_connected(&self) -> Result<bool> {
        self.connect(self.inner.config.connect_timeout).await
    }

    /// Connect, waiting at most `timeout` for the receive worker to come up.
    ///
    /// Idempotent once connected. A handshake timeout leaves the transport
    /// `NotConnected` so the caller may retry.
    pub async fn connect(&self, timeout: Duration) -> Result<bool> {
        self.inner.connect(timeout).await
    }

    /// Tear the connection down.
    ///
    /// A soft (`hard == false`) disconnect from a caller that still uses the
    /// transport is refused while requests are outstanding.
    pub async fn disconnect(&self, hard: bool, in_use: bool) -> Result<bool> {
        self.inner.disconnect(hard, in_use).await
    }

    /// Send a request chain and wait for every reply in it, in chain order
    pub async fn sendrecv(
        &self,
        chain: &mut Chain<B::Request, B::Response>,
        params: RequestParams,
    ) -> Result<()> {
        self.inner.sendrecv(chain, params).await
    }

    /// Single exchange convenience around [`sendrecv`](Self::sendrecv)
    pub async fn send(
        &self,
        request: B::Request,
        response: B::Response,
        params: RequestParams,
    ) -> Result<B::Response>
    where
        B::Response: Default,
    {
        let mut chain = Chain::new(request, response);
        self.sendrecv(&mut chain, params).await?;
        chain
            .into_bodies()
            .into_iter()
            .next()
            .ok_or_else(|| Error::transport("empty request chain"))
    }
}

impl<B: Binding> Drop for Transport<B> {
    fn drop(&mut self) {
        let inner = &self.inner;
        if !inner.state.get().is_disconnected() && inner.usage.load(Ordering::Acquire) != 0 {
            warn!("Transport {} was not properly released", inner.name);
        }
        let worker = inner
            .worker_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}

impl<B: Binding> fmt::Display for Transport<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

impl<B: Binding> fmt::Debug for Transport<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.get())
            .field("usage", &self.inner.usage.load(Ordering::Acquire))
            .field("pending", &self.inner.table.len())
            .finish()
    }
}

impl<B: Binding> Inner<B> {
    fn handshake(&self) -> MutexGuard<'_, Handshake> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock().await;

        match self.state.get() {
            ConnectionState::Connected => return Ok(true),
            ConnectionState::NotConnected => {}
            ConnectionState::Disconnected => {
                debug!("Reconnecting {}", self.name);
                self.state.apply(StateEvent::Reset)?;
            }
            ConnectionState::Connecting | ConnectionState::WorkerConnected => {
                // an earlier caller gave up waiting; pick up its handshake
                return self.finish_connect(&mut lifecycle, timeout).await;
            }
            ConnectionState::Error => {
                self.state.apply(StateEvent::Abandon)?;
                let cause = self.handshake().error.take();
                return Err(Error::Transport {
                    message: format!("Connection in error {}", self.name),
                    source: cause,
                });
            }
            ConnectionState::Disconnecting => {
                debug!("Trying to connect a disconnecting transport {}", self.name);
                return Ok(false);
            }
        }

        debug!("Connecting {}", self.name);
        self.state.apply(StateEvent::Connect)?;
        let generation = {
            let mut handshake = self.handshake();
            handshake.generation += 1;
            handshake.error = None;
            handshake.generation
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        lifecycle.handshake = Some(ready_rx);
        let worker = tokio::spawn(worker::run(self.clone(), generation, ready_tx));
        *self
            .worker_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(worker.abort_handle());
        lifecycle.worker = Some(worker);

        self.finish_connect(&mut lifecycle, timeout).await
    }

    async fn finish_connect(&self, lifecycle: &mut Lifecycle, timeout: Duration) -> Result<bool> {
        if let Some(ready) = lifecycle.handshake.as_mut() {
            // the outcome is read from the state below
            let _ = tokio::time::timeout(timeout, ready).await;
        }
        lifecycle.handshake = None;

        // the worker publishes under the handshake lock; decide under it too
        let (state, timed_out) = {
            let mut handshake = self.handshake();
            match self.state.get() {
                ConnectionState::Connecting => {
                    handshake.generation += 1;
                    (self.state.apply(StateEvent::HandshakeTimeout)?, true)
                }
                state => (state, false),
            }
        };

        if timed_out {
            self.cleanup_worker(lifecycle, timeout).await;
            self.state.apply(StateEvent::Reset)?;
            return Err(Error::ConnectionTimeout(format!(
                "Connection timeout {}",
                self.name
            )));
        }

        match state {
            ConnectionState::WorkerConnected => {
                self.state.apply(StateEvent::Established)?;
                debug!("Connected {}", self.name);
                Ok(true)
            }
            ConnectionState::Connected => Ok(true),
            ConnectionState::Error => {
                self.cleanup_worker(lifecycle, timeout).await;
                let cause = self.handshake().error.clone();
                match cause {
                    Some(cause) if cause.is_timeout() => {
                        // a socket connect timeout is retryable
                        self.handshake().error = None;
                        self.state.apply(StateEvent::Abandon)?;
                        self.state.apply(StateEvent::Reset)?;
                        Err(Error::ConnectionTimeout(format!("{}: {}", self.name, cause)))
                    }
                    cause => Err(Error::Transport {
                        message: format!("Failed to connect {}", self.name),
                        source: cause,
                    }),
                }
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_worker(&self, lifecycle: &mut Lifecycle, timeout: Duration) {
        let Some(worker) = lifecycle.worker.take() else {
            return;
        };
        if worker::on_worker(self.id) {
            return;
        }

        debug!("Interrupting transport worker {}", self.name);
        worker.abort();
        debug!("Joining transport worker {}", self.name);
        match tokio::time::timeout(timeout, worker).await {
            Ok(_) => debug!("Joined transport worker {}", self.name),
            Err(_) => warn!("Transport worker {} did not stop in {:?}", self.name, timeout),
        }
    }

    async fn disconnect(&self, hard: bool, in_use: bool) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut hard = hard;

        match self.state.get() {
            ConnectionState::NotConnected
            | ConnectionState::Disconnecting
            | ConnectionState::Disconnected => return Ok(false),
            ConnectionState::Connecting | ConnectionState::Error => {
                // a failed or orphaned connection attempt; just reset it
                self.handshake().generation += 1;
                self.state.apply(StateEvent::Abandon)?;
                lifecycle.handshake = None;
                if let Some(worker) = lifecycle.worker.take() {
                    if !worker::on_worker(self.id) {
                        worker.abort();
                    }
                }
                return Ok(false);
            }
            ConnectionState::WorkerConnected => hard = true,
            ConnectionState::Connected => {}
        }

        if !hard && in_use && !self.table.is_empty() {
            debug!(
                "Deferring disconnect of {}: {} requests outstanding",
                self.name,
                self.table.len()
            );
            return Ok(false);
        }

        self.state.apply(StateEvent::Disconnect)?;

        let usage = self.usage.load(Ordering::Acquire);
        let still_used = if in_use { usage != 1 } else { usage > 0 };
        if still_used {
            warn!(
                "Disconnecting transport while still in use {} (usage {})",
                self.name, usage
            );
        }
        debug!("Disconnecting transport {} (hard: {})", self.name, hard);

        let result = self.binding.do_disconnect(hard, in_use).await;
        self.state.apply(StateEvent::TeardownDone)?;

        if let Some(worker) = lifecycle.worker.take() {
            if !worker::on_worker(self.id) {
                worker.abort();
            }
        }
        self.table.wake_all();

        result.map(|was_in_use| was_in_use || still_used)
    }

    async fn sendrecv(
        &self,
        chain: &mut Chain<B::Request, B::Response>,
        params: RequestParams,
    ) -> Result<()> {
        let state = self.state.get();
        if state.is_disconnected() && state != ConnectionState::Disconnecting {
            return Err(Error::transport(format!(
                "Transport is disconnected {}",
                self.name
            )));
        }

        let timeout = if params.contains(RequestParams::NO_TIMEOUT) {
            None
        } else {
            self.binding
                .response_timeout(chain.head())
                .filter(|timeout| !timeout.is_zero())
        };

        let mut registration = Registration::new(&self.table);
        let result = self
            .exchange(chain, params, timeout, &mut registration)
            .await;
        drop(registration);

        match result {
            Err(e) if e.is_connection_failure() && !worker::on_worker(self.id) => {
                warn!("sendrecv failed on {}: {}", self.name, e);
                match self.disconnect(true, true).await {
                    Ok(_) => Err(e),
                    Err(suppressed) => {
                        info!("Disconnect failed on {}: {}", self.name, suppressed);
                        Err(Error::Suppressed {
                            error: Box::new(e),
                            suppressed: Box::new(suppressed),
                        })
                    }
                }
            }
            other => other,
        }
    }

    async fn exchange(
        &self,
        chain: &mut Chain<B::Request, B::Response>,
        params: RequestParams,
        timeout: Option<Duration>,
        registration: &mut Registration<'_, B::Response>,
    ) -> Result<()> {
        let first_key = self.prepare_requests(chain, params, timeout, registration)?;
        self.binding.do_send(chain.requests()).await?;

        if worker::on_worker(self.id) && self.receive_inline(chain, first_key).await? {
            return Ok(());
        }

        self.wait_for_responses(chain).await
    }

    /// Register every link of the chain before anything goes on the wire
    fn prepare_requests(
        &self,
        chain: &mut Chain<B::Request, B::Response>,
        params: RequestParams,
        timeout: Option<Duration>,
        registration: &mut Registration<'_, B::Response>,
    ) -> Result<u64> {
        let mut first_key = None;
        for (request, reply) in chain.links_mut() {
            reply.reset(params.contains(RequestParams::RETAIN_PAYLOAD));

            let key = self.binding.make_key(request)?;
            request.set_mid(key);
            first_key.get_or_insert(key);

            reply.set_expiration(timeout.map(|timeout| Instant::now() + timeout));
            reply.set_mid(key);
            registration.register(key, reply)?;
        }
        first_key.ok_or_else(|| Error::InvalidParameter("empty request chain".into()))
    }

    /// Receive directly when called on the receive worker itself, e.g. while
    /// it tears an idle connection down. Only the head of a chain is read
    /// here.
    ///
    /// Nobody else reads the stream meanwhile, so the wait is bounded by the
    /// reply's deadline, or by the idle timeout when the reply has none.
    async fn receive_inline(
        &self,
        chain: &mut Chain<B::Request, B::Response>,
        first_key: u64,
    ) -> Result<bool> {
        let Some((request, reply)) = chain.links_mut().next() else {
            return Ok(false);
        };
        let idle_deadline = self
            .config
            .idle_timeout
            .map(|timeout| Instant::now() + timeout);

        let _input = self.input.lock().await;
        loop {
            let next = self.receive_inline_once(first_key, reply);
            let complete = match reply.expiration().or(idle_deadline) {
                Some(deadline) => tokio::time::timeout_at(deadline, next)
                    .await
                    .map_err(|_| {
                        Error::RequestTimeout(format!(
                            "{} timed out waiting for response to mid {}",
                            self.name, first_key
                        ))
                    })??,
                None => next.await?,
            };
            if complete {
                return Ok(true);
            }
            self.binding.handle_intermediate(request, reply);
        }
    }

    /// Read one inbound message; `true` once the reply to `key` is complete
    async fn receive_inline_once(&self, key: u64, reply: &Reply<B::Response>) -> Result<bool> {
        match self.binding.peek_key().await? {
            Some(peeked) if peeked == key => {
                let payload = self.binding.do_recv(key).await?;
                reply.deliver(payload)
            }
            Some(peeked) => {
                debug!("Unexpected message id {} on {}, skipping message", peeked, self.name);
                self.binding.do_skip(peeked).await?;
                Ok(false)
            }
            None => Err(Error::EndOfStream),
        }
    }

    async fn wait_for_responses(&self, chain: &mut Chain<B::Request, B::Response>) -> Result<()> {
        for (request, reply) in chain.links_mut() {
            self.wait_for(request, reply).await?;
        }
        Ok(())
    }

    /// Sleep on the reply's signal, re-checking everything on every wake
    async fn wait_for(&self, request: &mut B::Request, reply: &Reply<B::Response>) -> Result<()> {
        loop {
            let notified = reply.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if reply.is_received() {
                return Ok(());
            }
            if self.binding.handle_intermediate(request, reply) {
                trace!("Interim reply for mid {} on {}", reply.mid(), self.name);
            }
            if let Some(cause) = reply.error() {
                return Err(Error::transport_caused_by(
                    format!("{} error reading response to mid {}", self.name, reply.mid()),
                    cause,
                ));
            }

            let state = self.state.get();
            if state.is_disconnected() && state != ConnectionState::Disconnecting {
                return Err(Error::transport(format!(
                    "Transport was disconnected while waiting for a response (transport: {} state: {:?})",
                    self.name, state
                )));
            }

            match reply.expiration() {
                Some(deadline) if Instant::now() >= deadline => {
                    debug!("State is {:?}", state);
                    return Err(Error::RequestTimeout(format!(
                        "{} timed out waiting for response to mid {}",
                        self.name,
                        reply.mid()
                    )));
                }
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                }
                None => notified.await,
            }
        }
    }
}
