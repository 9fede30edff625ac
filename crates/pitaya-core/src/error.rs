//! Error types for the Pitaya client core.
//!
//! Strongly-typed errors per concern. Synchronous API misuse (wrong lifecycle
//! state, unknown handler, unreadable certificate) is returned immediately;
//! asynchronous outcomes surface as [`CallError`] through call completions or
//! as events, never as return values.

use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::{call::CallId, connection::ClientState, event::HandlerId, pinning::Fingerprint};

/// Errors from lifecycle operations on the connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Operation not valid in the current lifecycle state.
    ///
    /// `state` tells "never connected" (`Inited`) apart from "still
    /// connecting" (`Connecting`).
    #[error("invalid state: cannot {operation} while {state:?}")]
    InvalidState {
        /// State when the operation was attempted
        state: ClientState,
        /// Operation that was attempted
        operation: &'static str,
    },
}

impl ConnectionError {
    /// Lifecycle state the error was raised in.
    pub fn state(&self) -> ClientState {
        match self {
            Self::InvalidState { state, .. } => *state,
        }
    }
}

/// Errors from the certificate pin store and certificate loading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    /// Certificate path does not exist
    #[error("no such file: {}", path.display())]
    NoSuchFile {
        /// Path that was requested
        path: PathBuf,
    },

    /// File exists but holds no parseable certificate
    #[error("corrupt certificate {}: {reason}", path.display())]
    CorruptCertificate {
        /// Path that was requested
        path: PathBuf,
        /// Parser diagnostic
        reason: String,
    },

    /// File exists but could not be read
    #[error("failed to read {}: {reason}", path.display())]
    Io {
        /// Path that was requested
        path: PathBuf,
        /// OS diagnostic
        reason: String,
    },

    /// Peer presented no certificate whose key is pinned
    #[error("no pinned key matches peer key {presented}")]
    Mismatch {
        /// Fingerprint of the peer's end-entity key
        presented: Fingerprint,
    },
}

/// Invalid client configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive is zero
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Offending field
        field: &'static str,
    },

    /// Reconnect delay cap below the base delay
    #[error("reconnect_delay_max ({max:?}) is smaller than reconnect_delay ({base:?})")]
    BackoffInverted {
        /// Base delay
        base: std::time::Duration,
        /// Cap
        max: std::time::Duration,
    },

    /// A duration too long to be scheduled
    #[error("{field} exceeds the longest schedulable timeout ({max:?})")]
    DurationTooLong {
        /// Offending field
        field: &'static str,
        /// Longest accepted value
        max: std::time::Duration,
    },

    /// Heartbeat timeout factor must allow at least one missed beat
    #[error("heartbeat_timeout_factor must be at least 1, got {0}")]
    HeartbeatFactor(u32),
}

/// Errors from the event handler registry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    /// Handler id unknown or already removed
    #[error("event handler {id} not found")]
    NotFound {
        /// Requested id
        id: HandlerId,
    },

    /// Handler table is full or the id space is exhausted
    #[error("event handler limit reached")]
    Exhausted,
}

/// Why a pending call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Caller disconnected
    Disconnected,
    /// Transport dropped, server kicked us, or heartbeats stopped
    ConnectionLost,
    /// Client handle cleaned up
    Cleanup,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disconnected => "disconnected",
            Self::ConnectionLost => "connection lost",
            Self::Cleanup => "client cleaned up",
        };
        f.write_str(text)
    }
}

/// Outcome errors for requests and notifies.
///
/// All variants except `DuplicateCallId` and `InvalidState` are delivered
/// through the call's error callback; those two are returned synchronously
/// when the call is issued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Deadline elapsed without a response or write acknowledgement
    #[error("call timed out")]
    Timeout,

    /// Resolved by disconnect or cleanup
    #[error("call cancelled: {0}")]
    Cancelled(CancelReason),

    /// Server answered with an error response
    #[error("server error {code}: {message}")]
    Server {
        /// Application error code
        code: String,
        /// Server message
        message: String,
    },

    /// Transport could not accept the call
    #[error("transport error: {0}")]
    Transport(String),

    /// Caller id already maps to a pending call
    #[error("caller id {0} already has a pending call")]
    DuplicateCallId(CallId),

    /// Calls are only accepted while connected
    #[error("cannot issue call while {0:?}")]
    InvalidState(ClientState),
}

impl CallError {
    /// Returns true if retrying the call later may succeed.
    ///
    /// Timeouts and connection-level cancellations are transient. Server
    /// errors, duplicate ids and cleanup are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Transport(_)
                | Self::Cancelled(CancelReason::Disconnected | CancelReason::ConnectionLost)
        )
    }

    /// Returns true if the call was resolved by disconnect or cleanup.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_connection_loss_are_transient() {
        assert!(CallError::Timeout.is_transient());
        assert!(CallError::Cancelled(CancelReason::ConnectionLost).is_transient());
        assert!(CallError::Transport("reset".into()).is_transient());
    }

    #[test]
    fn cleanup_and_server_errors_are_fatal() {
        assert!(!CallError::Cancelled(CancelReason::Cleanup).is_transient());
        assert!(
            !CallError::Server { code: "PIT-500".into(), message: "boom".into() }.is_transient()
        );
        assert!(!CallError::DuplicateCallId(CallId(1)).is_transient());
    }

    #[test]
    fn invalid_state_reports_observed_state() {
        let err = ConnectionError::InvalidState {
            state: ClientState::Connecting,
            operation: "disconnect",
        };
        assert_eq!(err.state(), ClientState::Connecting);
        assert_eq!(err.to_string(), "invalid state: cannot disconnect while Connecting");
    }
}
