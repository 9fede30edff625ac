//! Protocol
//!
//! Wire types exchanged between a Pitaya client and server.
//!
//! Two layers:
//!
//! - [`Packet`]: transport framing. A 4-byte header (1 type byte, 3-byte
//!   big-endian body length) followed by the body. Handshake, heartbeat and
//!   kick packets are interpreted by the session layer; data packets carry a
//!   [`Message`].
//! - [`Message`]: CBOR-encoded request, notify, response and push messages
//!   addressed by route.
//!
//! Nothing here performs I/O. [`PacketDecoder`] accepts arbitrary byte chunks
//! as they arrive from a stream and yields whole packets.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod errors;
pub mod handshake;
mod message;
mod packet;

use serde::{Serialize, de::DeserializeOwned};

pub use errors::{ProtocolError, Result};
pub use handshake::{HANDSHAKE_OK, HandshakeRequest, HandshakeResponse, Kick};
pub use message::{ErrorBody, Message, MessageKind};
pub use packet::{HEADER_SIZE, MAX_BODY_SIZE, Packet, PacketDecoder, PacketType};

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: &str = "0.3.0";

/// Serialize a value to CBOR.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR.
pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
