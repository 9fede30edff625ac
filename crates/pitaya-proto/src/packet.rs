//! Packet framing.
//!
//! Layout on the wire:
//!
//! ```text
//! +------+-----------------------+----------------------+
//! | type | body length (24 bit)  | body (length bytes)  |
//! | u8   | big endian            |                      |
//! +------+-----------------------+----------------------+
//! ```
//!
//! The length field is 24 bits, so a body can never exceed
//! [`MAX_BODY_SIZE`]. Decoders reject unknown type bytes immediately instead
//! of waiting for the body, which keeps a garbage stream from pinning memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Size of the packet header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest body representable by the 24-bit length field.
pub const MAX_BODY_SIZE: usize = (1 << 24) - 1;

/// Packet type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client hello carrying [`crate::HandshakeRequest`]
    Handshake = 0x01,
    /// Client acknowledgement of the server handshake response
    HandshakeAck = 0x02,
    /// Keepalive, sent by both sides
    Heartbeat = 0x03,
    /// Application data carrying a [`crate::Message`]
    Data = 0x04,
    /// Server is closing the session
    Kick = 0x05,
}

impl PacketType {
    /// Parse a type byte. `None` if unknown.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Kick),
            _ => None,
        }
    }

    /// Wire representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A single framed packet.
///
/// # Invariants
///
/// - `body.len() <= MAX_BODY_SIZE` for any packet produced by a decoder.
///   Packets built by hand are checked on [`Packet::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type
    pub kind: PacketType,
    /// Raw body bytes
    pub body: Bytes,
}

impl Packet {
    /// Create a packet with the given body.
    pub fn new(kind: PacketType, body: impl Into<Bytes>) -> Self {
        Self { kind, body: body.into() }
    }

    /// Create a packet with an empty body (heartbeat, handshake ack).
    pub fn empty(kind: PacketType) -> Self {
        Self { kind, body: Bytes::new() }
    }

    /// Total encoded size (header + body).
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Append the encoded packet to `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::BodyTooLarge` if the body does not fit in 24 bits
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let len = self.body.len();
        if len > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge { size: len, max: MAX_BODY_SIZE });
        }

        dst.put_u8(self.kind.to_u8());
        let len_bytes = (len as u32).to_be_bytes();
        dst.put_slice(&len_bytes[1..]);
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one packet from `buf`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PacketTooShort` if the header or body is truncated
    /// - `ProtocolError::UnknownPacketType` for an unrecognized type byte
    /// - `ProtocolError::TrailingBytes` if `buf` holds more than one packet
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (kind, body_len) = parse_header(buf)?;

        let total = HEADER_SIZE + body_len;
        if buf.len() < total {
            return Err(ProtocolError::PacketTooShort { expected: total, actual: buf.len() });
        }
        if buf.len() > total {
            return Err(ProtocolError::TrailingBytes(buf.len() - total));
        }

        Ok(Self { kind, body: Bytes::copy_from_slice(&buf[HEADER_SIZE..total]) })
    }
}

/// Parse type and body length from the first [`HEADER_SIZE`] bytes.
fn parse_header(buf: &[u8]) -> Result<(PacketType, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::PacketTooShort { expected: HEADER_SIZE, actual: buf.len() });
    }

    let kind = PacketType::from_u8(buf[0]).ok_or(ProtocolError::UnknownPacketType(buf[0]))?;
    let body_len = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;

    Ok((kind, body_len))
}

/// Incremental packet decoder for stream transports.
///
/// Feed bytes with [`PacketDecoder::extend`] in whatever chunks the socket
/// produces and pull complete packets with [`PacketDecoder::next_packet`].
#[derive(Debug)]
pub struct PacketDecoder {
    buf: BytesMut,
    max_body: usize,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    /// Decoder accepting bodies up to [`MAX_BODY_SIZE`].
    pub fn new() -> Self {
        Self::with_max_body(MAX_BODY_SIZE)
    }

    /// Decoder with a tighter body limit.
    pub fn with_max_body(max_body: usize) -> Self {
        Self { buf: BytesMut::new(), max_body: max_body.min(MAX_BODY_SIZE) }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete packet, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error as soon as the header is known to be invalid. The
    /// decoder is unusable afterwards; the connection should be dropped.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (kind, body_len) = parse_header(&self.buf)?;
        if body_len > self.max_body {
            return Err(ProtocolError::BodyTooLarge { size: body_len, max: self.max_body });
        }

        if self.buf.len() < HEADER_SIZE + body_len {
            self.buf.reserve(HEADER_SIZE + body_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let body = self.buf.split_to(body_len).freeze();

        Ok(Some(Packet { kind, body }))
    }
}
