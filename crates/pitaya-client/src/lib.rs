//! Client
//!
//! Thread-safe Pitaya client. Wraps the Sans-IO state machines from
//! [`pitaya_core`] in a handle that can be shared across threads, and drives
//! them over TCP or TLS from a tokio task.
//!
//! # Architecture
//!
//! Caller operations and transport reports are applied to the same state
//! machines under one lock. Their outputs (events, call completions) are
//! queued and delivered in order, either on the I/O thread or, with polling
//! enabled, from [`Client::poll`].
//!
//! # Components
//!
//! - [`Client`]: lifecycle, event handlers, request and notify
//! - [`TlsOptions`]: CA roots; pinned keys live in [`PinStore`]
//! - [`Connector`]: pluggable transport ([`TcpConnector`], [`TlsConnector`])
//! - [`SystemEnv`]: tokio-backed [`Environment`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;
mod system_env;
mod tls;
mod transport;

pub use client::{Client, ClientBuilder, EventCallback, NotifyCallback, ResponseCallback};
pub use error::ClientError;
pub use pitaya_core::{
    CallError, CallId, CancelReason, ClientConfig, ClientState, ConnectFailure, Environment, Event,
    EventFilter, EventKind, FailureKind, Fingerprint, HandlerId, MAX_TIMEOUT, PinError, PinStore,
    RetryLimit, SkipCheckGuard, Target, TransportKind,
};
pub use system_env::SystemEnv;
pub use tls::TlsOptions;
pub use transport::{BoxStream, Connector, Stream, TLS_HANDSHAKE_ERROR, TcpConnector, TlsConnector};
