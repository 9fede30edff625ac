//! Client error types.

use pitaya_core::{CallError, ClientState, ConfigError, ConnectionError, HandlerError, PinError};
use pitaya_proto::ProtocolError;
use thiserror::Error;

/// Synchronous failures of the client API.
///
/// Asynchronous outcomes never show up here: connect results arrive as
/// events and call results arrive through the call's completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Lifecycle operation not valid in the current state
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Call rejected before it was sent
    #[error(transparent)]
    Call(#[from] CallError),

    /// Unknown handler or handler table full
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Certificate could not be loaded
    #[error(transparent)]
    Pin(#[from] PinError),

    /// Message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// TLS configuration could not be built
    #[error("tls configuration error: {0}")]
    Tls(String),

    /// Async runtime could not be started
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ClientError {
    /// Lifecycle state reported by state errors.
    pub fn state(&self) -> Option<ClientState> {
        match self {
            Self::Connection(err) => Some(err.state()),
            Self::Call(CallError::InvalidState(state)) => Some(*state),
            _ => None,
        }
    }

    /// Returns true if the same call may succeed later without changes.
    ///
    /// State errors are transient: the client may simply not be connected
    /// yet. Configuration, certificate and encoding errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Call(err) => err.is_transient() || matches!(err, CallError::InvalidState(_)),
            Self::Handler(_)
            | Self::Config(_)
            | Self::Pin(_)
            | Self::Protocol(_)
            | Self::Tls(_)
            | Self::Runtime(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use pitaya_core::{CallId, HandlerId};

    use super::*;

    #[test]
    fn state_is_exposed_for_state_errors() {
        let err: ClientError =
            ConnectionError::InvalidState { state: ClientState::Inited, operation: "disconnect" }
                .into();
        assert_eq!(err.state(), Some(ClientState::Inited));
        assert!(err.is_transient());

        let err: ClientError = CallError::InvalidState(ClientState::Connecting).into();
        assert_eq!(err.state(), Some(ClientState::Connecting));
    }

    #[test]
    fn caller_mistakes_are_not_transient() {
        let err: ClientError = CallError::DuplicateCallId(CallId(3)).into();
        assert!(!err.is_transient());

        let err: ClientError = HandlerError::NotFound { id: HandlerId(9) }.into();
        assert!(!err.is_transient());
        assert_eq!(err.state(), None);
    }
}
