//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while framing or decoding protocol data.
///
/// All variants are structural: they describe malformed input, never I/O
/// failures. A peer that triggers one of these is broken or hostile and the
/// connection should be dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than the packet it claims to hold
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Packet type byte not recognized
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// Body exceeds the maximum encodable size
    #[error("packet body too large: {size} bytes (max {max})")]
    BodyTooLarge {
        /// Actual body size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Extra bytes after a packet decoded with [`crate::Packet::decode`]
    #[error("trailing bytes after packet: {0}")]
    TrailingBytes(usize),

    /// Packet of the wrong type handed to a typed decoder
    #[error("unexpected packet type: expected {expected:?}, got {actual:?}")]
    UnexpectedPacket {
        /// Type the decoder handles
        expected: crate::PacketType,
        /// Type that was received
        actual: crate::PacketType,
    },

    /// CBOR serialization failed
    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),

    /// Message decoded but violates field requirements for its kind
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
