//! Error types for the SMB transport

use crate::transport::state::{ConnectionState, StateEvent};
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for transport operations
///
/// Every failure the transport can surface is a variant of this one enum, so
/// generic retry logic can match broadly (see [`Error::is_connection_failure`])
/// while targeted logic matches a single variant.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connect handshake did not complete in time
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// A single exchange exceeded its deadline
    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    /// General transport failure, optionally chaining the failure observed by
    /// the receive worker
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Arc<Error>>,
    },

    /// The peer closed the stream at a message boundary
    #[error("End of stream")]
    EndOfStream,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// No traffic for the idle period and nobody holds the transport
    #[error("Idle timeout")]
    IdleTimeout,

    /// Usage count would drop below zero
    #[error("Usage count dropped below zero")]
    UsageUnderflow,

    /// State machine error
    #[error("Invalid state transition: {event:?} in state {from:?}")]
    InvalidStateTransition {
        from: ConnectionState,
        event: StateEvent,
    },

    /// The correlation key is already outstanding
    #[error("Duplicate correlation key: {0}")]
    DuplicateKey(u64),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid SMB header
    #[error("Invalid SMB header: {0}")]
    InvalidHeader(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A failure plus a second one hit while disconnecting because of it
    #[error("{error} (disconnect failed: {suppressed})")]
    Suppressed {
        #[source]
        error: Box<Error>,
        suppressed: Box<Error>,
    },
}

impl Error {
    /// Generic transport error without a chained cause
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Generic transport error chaining `cause`
    pub fn transport_caused_by(message: impl Into<String>, cause: Arc<Error>) -> Self {
        Error::Transport {
            message: message.into(),
            source: Some(cause),
        }
    }

    /// Timeouts of any kind, including socket read timeouts
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ConnectionTimeout(_) | Error::RequestTimeout(_) | Error::IdleTimeout => true,
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            Error::Suppressed { error, .. } => error.is_timeout(),
            _ => false,
        }
    }

    /// The peer went away; no recovery is expected on this connection
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::EndOfStream => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            Error::Suppressed { error, .. } => error.is_closed(),
            _ => false,
        }
    }

    /// Failures that mean the connection itself can no longer be trusted.
    ///
    /// A request timeout is deliberately not one of them: the transport stays
    /// connected and a later stray reply is skipped.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Transport { .. }
            | Error::EndOfStream
            | Error::ConnectionClosed
            | Error::IdleTimeout
            | Error::Protocol(_) => true,
            Error::Suppressed { error, .. } => error.is_connection_failure(),
            _ => false,
        }
    }

    /// Caller-side bugs rather than network conditions
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UsageUnderflow | Error::InvalidStateTransition { .. }
        )
    }
}

/// SMB2 status codes the transport itself needs to recognize (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x00000000,
    /// The operation is still in progress; a final reply follows
    Pending = 0x00000103,
    /// The data was too large to fit into the buffer
    BufferOverflow = 0x80000005,
    /// More processing required
    MoreProcessingRequired = 0xC0000016,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
    /// The request timed out
    IoTimeout = 0xC00000B5,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// The specified network name is no longer available
    NetworkNameDeleted = 0xC00000C9,
    /// The I/O request was canceled
    Cancelled = 0xC0000120,
}

impl TryFrom<u32> for NtStatus {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000000 => Ok(NtStatus::Success),
            0x00000103 => Ok(NtStatus::Pending),
            0x80000005 => Ok(NtStatus::BufferOverflow),
            0xC0000016 => Ok(NtStatus::MoreProcessingRequired),
            0xC0000022 => Ok(NtStatus::AccessDenied),
            0xC000000D => Ok(NtStatus::InvalidParameter),
            0xC000009A => Ok(NtStatus::InsufficientResources),
            0xC00000B5 => Ok(NtStatus::IoTimeout),
            0xC00000BB => Ok(NtStatus::NotSupported),
            0xC00000C9 => Ok(NtStatus::NetworkNameDeleted),
            0xC0000120 => Ok(NtStatus::Cancelled),
            other => Err(other),
        }
    }
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        (self as u32) & 0xC0000000 == 0xC0000000
    }

    /// Check if this is a warning status
    pub fn is_warning(self) -> bool {
        (self as u32) & 0x80000000 == 0x80000000 && !self.is_error()
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::Success => "Success",
            NtStatus::Pending => "Pending",
            NtStatus::BufferOverflow => "Buffer overflow",
            NtStatus::MoreProcessingRequired => "More processing required",
            NtStatus::AccessDenied => "Access denied",
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::InsufficientResources => "Insufficient resources",
            NtStatus::IoTimeout => "I/O timeout",
            NtStatus::NotSupported => "Not supported",
            NtStatus::NetworkNameDeleted => "Network name deleted",
            NtStatus::Cancelled => "Cancelled",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
