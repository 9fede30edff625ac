//! Session handshake and kick payloads.
//!
//! The client opens every session with a [`HandshakeRequest`]. The server
//! answers with a [`HandshakeResponse`]; code [`HANDSHAKE_OK`] accepts the
//! session and may negotiate a heartbeat interval. The client confirms with an
//! empty `HandshakeAck` packet.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    PROTOCOL_VERSION, Packet, PacketType,
    errors::{ProtocolError, Result},
    from_cbor, to_cbor,
};

/// Handshake response code accepting the session.
pub const HANDSHAKE_OK: u16 = 200;

/// Client handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client protocol version
    pub version: String,
    /// Application data forwarded to the server (the `extra` connect argument)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

impl HandshakeRequest {
    /// Handshake for the current protocol version.
    pub fn new(user_data: Option<String>) -> Self {
        Self { version: PROTOCOL_VERSION.to_string(), user_data }
    }

    /// Encode as a handshake packet.
    pub fn into_packet(self) -> Result<Packet> {
        Ok(Packet::new(PacketType::Handshake, to_cbor(&self)?))
    }

    /// Decode from a handshake packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        expect_kind(packet, PacketType::Handshake)?;
        from_cbor(&packet.body)
    }
}

/// Server handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// [`HANDSHAKE_OK`] or a rejection code
    pub code: u16,
    /// Negotiated heartbeat interval in seconds; `None` disables heartbeats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_secs: Option<u64>,
}

impl HandshakeResponse {
    /// Accepting response.
    pub fn ok(heartbeat: Option<Duration>) -> Self {
        Self { code: HANDSHAKE_OK, heartbeat_secs: heartbeat.map(|d| d.as_secs().max(1)) }
    }

    /// Whether the server accepted the session.
    pub fn is_ok(&self) -> bool {
        self.code == HANDSHAKE_OK
    }

    /// Negotiated heartbeat interval.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Encode as a handshake packet (servers reply with the same type).
    pub fn into_packet(self) -> Result<Packet> {
        Ok(Packet::new(PacketType::Handshake, to_cbor(&self)?))
    }

    /// Decode from a handshake packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        expect_kind(packet, PacketType::Handshake)?;
        from_cbor(&packet.body)
    }
}

/// Server-initiated session close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    /// Reason given by the server (may be empty)
    pub reason: String,
}

impl Kick {
    /// Encode as a kick packet. The body is the UTF-8 reason.
    pub fn into_packet(self) -> Packet {
        Packet::new(PacketType::Kick, self.reason.into_bytes())
    }

    /// Decode from a kick packet. Invalid UTF-8 is replaced, not rejected.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        expect_kind(packet, PacketType::Kick)?;
        Ok(Self { reason: String::from_utf8_lossy(&packet.body).into_owned() })
    }
}

fn expect_kind(packet: &Packet, expected: PacketType) -> Result<()> {
    if packet.kind == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedPacket { expected, actual: packet.kind })
    }
}
