//! Multiplexed SMB client transport
//!
//! Many concurrent callers share one connection. Each request is stamped
//! with a correlation key; a single receive worker reads inbound messages
//! and hands every reply to the caller waiting on that key.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod message;
pub mod netbios;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub mod e2e_tests;

pub use config::TransportConfig;
pub use error::{Error, NtStatus, Result};
pub use message::{Chain, Message, Reply, Request, RequestParams, Response};
pub use transport::tcp::TcpBinding;
pub use transport::{Binding, ConnectionState, Transport};
