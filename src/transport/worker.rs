//! Receive worker
//!
//! One task per connection. It finishes the connection handshake on behalf
//! of the connecting caller, then demultiplexes inbound messages into the
//! correlation table until the stream fails, closes or goes idle.

use super::{Binding, Inner, StateEvent};
use crate::error::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

tokio::task_local! {
    static RECEIVE_WORKER: u64;
}

/// Whether the current task is the receive worker of transport `id`
pub(crate) fn on_worker(id: u64) -> bool {
    RECEIVE_WORKER.try_with(|worker| *worker == id).unwrap_or(false)
}

pub(crate) async fn run<B: Binding>(
    inner: Arc<Inner<B>>,
    generation: u64,
    ready: oneshot::Sender<()>,
) {
    let id = inner.id;
    RECEIVE_WORKER
        .scope(id, async move {
            if establish(&inner, generation, ready).await {
                inner.receive_loop().await;
            }
        })
        .await
}

/// Connect the stream and publish the outcome to the connecting caller
async fn establish<B: Binding>(
    inner: &Inner<B>,
    generation: u64,
    ready: oneshot::Sender<()>,
) -> bool {
    let outcome = if inner.state.get().is_failed() {
        Ok(())
    } else {
        inner.binding.do_connect().await
    };

    let mut handshake = inner.handshake();
    if handshake.generation != generation {
        match &outcome {
            Ok(()) => debug!("Transport {} connected after the caller gave up", inner.name),
            Err(e) if e.is_timeout() => debug!("Timeout connecting {}: {}", inner.name, e),
            Err(e) => warn!("Exception in transport worker {}: {}", inner.name, e),
        }
        return false;
    }

    let (event, connected) = match outcome {
        Ok(()) => (StateEvent::WorkerReady, true),
        Err(e) => {
            debug!("Connecting {} failed: {}", inner.name, e);
            handshake.error = Some(Arc::new(e));
            (StateEvent::WorkerFailed, false)
        }
    };
    if let Err(e) = inner.state.apply(event) {
        debug!("Transport {} left the connecting state early: {}", inner.name, e);
        return false;
    }
    drop(handshake);

    // the caller may have stopped listening; the state already says it all
    let _ = ready.send(());
    connected
}

impl<B: Binding> Inner<B> {
    async fn receive_loop(&self) {
        loop {
            if let Err(e) = self.receive_next().await {
                self.fail(e).await;
                return;
            }
        }
    }

    async fn receive_next(&self) -> Result<()> {
        let _input = self.input.lock().await;

        let key = loop {
            let Some(idle) = self.config.idle_timeout else {
                break self.binding.peek_key().await?;
            };
            match tokio::time::timeout(idle, self.binding.peek_key()).await {
                Ok(peeked) => break peeked?,
                Err(_) => {
                    trace!("Socket timeout during peek on {}", self.name);
                    if self.usage.load(Ordering::Acquire) > 0 {
                        debug!("Transport still in use, no idle timeout {}", self.name);
                        // waiters past their deadline need a nudge
                        self.table.wake_all();
                        continue;
                    }
                    debug!("Idle timeout on {}", self.name);
                    return Err(Error::IdleTimeout);
                }
            }
        };

        let Some(key) = key else {
            return Err(Error::EndOfStream);
        };

        match self.table.get(key) {
            Some(reply) => {
                let payload = self.binding.do_recv(key).await?;
                reply.deliver(payload)?;
                Ok(())
            }
            None => {
                debug!("Unexpected message id, skipping message {}", key);
                self.binding.do_skip(key).await
            }
        }
    }

    /// Tear the connection down and hand `error` to every pending caller
    async fn fail(&self, error: Error) {
        let timeout = error.is_timeout();
        let closed = error.is_closed();
        if closed {
            debug!("Remote closed connection {}", self.name);
        } else if timeout {
            debug!("Socket timeout on {}: {}", self.name, error);
        } else {
            debug!("Receive failed on {}: {}", self.name, error);
        }

        let error = match self.disconnect(!(timeout || closed), false).await {
            Ok(_) => error,
            Err(suppressed) => {
                warn!("Failed to disconnect {}: {}", self.name, suppressed);
                Error::Suppressed {
                    error: Box::new(error),
                    suppressed: Box::new(suppressed),
                }
            }
        };
        debug!("Disconnected {}", self.name);

        let cause = Arc::new(error);
        let notified = self.table.fail_all(cause.clone());
        if notified > 0 {
            debug!("Notified {} clients of {}: {}", notified, self.name, cause);
        } else {
            debug!("Exception without a request pending on {}: {}", self.name, cause);
        }
    }
}
