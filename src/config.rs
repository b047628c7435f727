//! Transport configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Default time to wait for a reply to a single request
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default time to wait for the connection handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(35_000);

/// Default time the receive worker waits for inbound traffic before it
/// re-evaluates whether the connection is idle
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(35_000);

/// Default upper bound for one inbound or outbound message
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 0x10000;

/// Default size of the SMB2 credit window the client asks the server for
pub const DEFAULT_DESIRED_CREDITS: u16 = 512;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Remote endpoint, used by bindings that open their own socket
    pub remote_addr: Option<SocketAddr>,
    /// Per-request reply timeout; zero disables it
    pub response_timeout: Duration,
    /// Budget for `connect` and for opening the socket
    pub connect_timeout: Duration,
    /// Receive worker idle period; `None` waits forever
    pub idle_timeout: Option<Duration>,
    /// Largest message accepted from or sent to the peer
    pub max_buffer_size: usize,
    /// Credits the client tries to keep available
    pub desired_credits: u16,
    /// Label used in log lines; generated when absent
    pub name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            remote_addr: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            desired_credits: DEFAULT_DESIRED_CREDITS,
            name: None,
        }
    }
}

impl TransportConfig {
    /// Configuration for a binding connecting to `addr`
    pub fn for_addr(addr: SocketAddr) -> Self {
        Self {
            remote_addr: Some(addr),
            ..Default::default()
        }
    }

    /// The response timeout, or `None` when it is disabled
    pub fn response_timeout(&self) -> Option<Duration> {
        if self.response_timeout.is_zero() {
            None
        } else {
            Some(self.response_timeout)
        }
    }
}
