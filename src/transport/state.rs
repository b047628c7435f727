//! Connection state machine

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Initial state, and the state a timed-out connect leaves behind
    NotConnected = 0,
    /// A caller is waiting for the worker to establish the stream
    Connecting = 1,
    /// The worker established the stream; the caller has not observed it yet
    WorkerConnected = 2,
    /// Ready for traffic
    Connected = 3,
    /// Establishing the stream failed
    Error = 4,
    /// Teardown in progress
    Disconnecting = 5,
    /// Torn down; inert until the next connect
    Disconnected = 6,
}

/// Inputs to the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// A caller starts connecting
    Connect,
    /// The worker established the stream
    WorkerReady,
    /// The worker failed to establish the stream
    WorkerFailed,
    /// The connecting caller observed the worker's success
    Established,
    /// The connecting caller gave up waiting for the worker
    HandshakeTimeout,
    /// Teardown starts
    Disconnect,
    /// Teardown finished
    TeardownDone,
    /// A failed or unfinished connection attempt is discarded
    Abandon,
    /// A torn-down transport becomes connectable again
    Reset,
}

impl ConnectionState {
    /// The state reached by applying `event`; invalid pairs are rejected
    pub fn on(self, event: StateEvent) -> Result<Self> {
        use ConnectionState as S;
        use StateEvent as E;

        let next = match (self, event) {
            (S::NotConnected, E::Connect) => S::Connecting,
            (S::Connecting, E::WorkerReady) => S::WorkerConnected,
            (S::Connecting, E::WorkerFailed) => S::Error,
            (S::Connecting, E::HandshakeTimeout) => S::Disconnected,
            (S::Connecting, E::Abandon) => S::Disconnected,
            (S::WorkerConnected, E::Established) => S::Connected,
            (S::WorkerConnected, E::Disconnect) => S::Disconnecting,
            (S::Connected, E::Disconnect) => S::Disconnecting,
            (S::Disconnecting, E::TeardownDone) => S::Disconnected,
            (S::Error, E::Abandon) => S::Disconnected,
            (S::Disconnected, E::Reset) => S::NotConnected,
            (from, event) => return Err(Error::InvalidStateTransition { from, event }),
        };
        Ok(next)
    }

    /// Not usable for new traffic
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            ConnectionState::NotConnected
                | ConnectionState::Error
                | ConnectionState::Disconnecting
                | ConnectionState::Disconnected
        )
    }

    /// Being or already torn down
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnecting | ConnectionState::Disconnected
        )
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => ConnectionState::NotConnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::WorkerConnected,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Error,
            5 => ConnectionState::Disconnecting,
            // only tags written by `StateCell::apply` are ever stored
            _ => ConnectionState::Disconnected,
        }
    }
}

/// The one transport-wide state variable
///
/// Readable without locks; every write goes through the transition function.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::NotConnected as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_tag(self.0.load(Ordering::Acquire))
    }

    /// Apply `event` atomically, returning the new state
    pub(crate) fn apply(&self, event: StateEvent) -> Result<ConnectionState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = ConnectionState::from_tag(current).on(event)?;
            match self.0.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }
}
