//! Test harness for the Pitaya client.
//!
//! Provides a scripted server ([`TestServer`]) reachable over TCP, TLS with a
//! self-signed [`ServerIdentity`], or an in-memory transport, plus an
//! [`EventLog`] that records client events for assertions.
//!
//! Integration tests drive a real [`pitaya_client::Client`] against the
//! server and assert on observable behavior only: the event sequence, call
//! outcomes and what the server received.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod certs;
pub mod events;
pub mod server;

use thiserror::Error;

pub use certs::{LOCALHOST_NAMES, ServerIdentity};
pub use events::EventLog;
pub use server::{Reply, ServerScript, TestServer};

/// Harness setup failures.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Socket or file I/O failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate generation or parsing failed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// TLS configuration failed
    #[error("tls error: {0}")]
    Tls(String),
}
