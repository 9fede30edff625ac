//! Core
//!
//! Sans-IO state machines behind the Pitaya client. Nothing in this crate
//! performs I/O or reads the clock: callers pass time in and execute the
//! returned actions.
//!
//! # Components
//!
//! - [`PinStore`]: pinned public keys and the skip-check override consulted
//!   during the TLS handshake
//! - [`Connection`]: client lifecycle (`Inited -> Connecting -> Connected ->
//!   Disconnecting -> Inited`, terminal `CleanedUp`) including the session
//!   handshake, heartbeats and reconnect backoff
//! - [`EventDispatcher`]: handler registry resolving which handlers receive an
//!   event at the moment it is emitted
//! - [`CallRegistry`]: in-flight requests and notifies with deadlines and
//!   exactly-once resolution
//!
//! The `pitaya-client` crate composes these behind a thread-safe handle and
//! drives them from a tokio transport.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod call;
pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod event;
pub mod pinning;

pub use call::{CallId, CallKind, CallRegistry, PendingCall};
pub use config::{ClientConfig, MAX_TIMEOUT, RetryLimit, TransportKind};
pub use connection::{
    AttemptId, ClientState, ConnectFailure, Connection, ConnectionAction, FailureKind, Target,
    TransportEvent,
};
pub use env::{Environment, Timestamp};
pub use error::{CallError, CancelReason, ConfigError, ConnectionError, HandlerError, PinError};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, HandlerId};
pub use pinning::{Fingerprint, PinStore, SkipCheckGuard};
