//! Route-addressed application messages carried in data packets.

use serde::{Deserialize, Serialize};

use crate::{
    Packet, PacketType,
    errors::{ProtocolError, Result},
    from_cbor, to_cbor,
};

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Client request expecting a response with the same id
    Request,
    /// Client notification, no response
    Notify,
    /// Server response to a request
    Response,
    /// Unsolicited server message addressed by route
    Push,
}

/// Application message.
///
/// # Invariants
///
/// Enforced by [`Message::decode`]:
///
/// - `Request` has both `id` and `route`
/// - `Notify` and `Push` have a `route` and no `id`
/// - `Response` has an `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,
    /// Request id (requests and responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Route (requests, notifies and pushes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Opaque body
    pub body: Vec<u8>,
    /// Response carries an [`ErrorBody`] instead of a result
    #[serde(default)]
    pub error: bool,
}

impl Message {
    /// Build a request.
    pub fn request(id: u32, route: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Request,
            id: Some(id),
            route: Some(route.into()),
            body: body.into(),
            error: false,
        }
    }

    /// Build a notify.
    pub fn notify(route: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Notify,
            id: None,
            route: Some(route.into()),
            body: body.into(),
            error: false,
        }
    }

    /// Build a successful response.
    pub fn response(id: u32, body: impl Into<Vec<u8>>) -> Self {
        Self { kind: MessageKind::Response, id: Some(id), route: None, body: body.into(), error: false }
    }

    /// Build an error response.
    pub fn error_response(id: u32, error: &ErrorBody) -> Result<Self> {
        Ok(Self {
            kind: MessageKind::Response,
            id: Some(id),
            route: None,
            body: error.encode()?,
            error: true,
        })
    }

    /// Build a push.
    pub fn push(route: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Push,
            id: None,
            route: Some(route.into()),
            body: body.into(),
            error: false,
        }
    }

    /// CBOR-encode the message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Decode and validate a message.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborDecode` if the bytes are not a message
    /// - `ProtocolError::InvalidMessage` if required fields are missing
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Self = from_cbor(bytes)?;
        message.validate()?;
        Ok(message)
    }

    /// Wrap in a data packet.
    pub fn into_packet(self) -> Result<Packet> {
        Ok(Packet::new(PacketType::Data, self.encode()?))
    }

    /// Extract from a data packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.kind != PacketType::Data {
            return Err(ProtocolError::UnexpectedPacket {
                expected: PacketType::Data,
                actual: packet.kind,
            });
        }
        Self::decode(&packet.body)
    }

    /// Decode the error body of an error response.
    pub fn error_body(&self) -> Option<ErrorBody> {
        if self.error { ErrorBody::decode(&self.body).ok() } else { None }
    }

    fn validate(&self) -> Result<()> {
        let ok = match self.kind {
            MessageKind::Request => self.id.is_some() && self.route.is_some(),
            MessageKind::Notify | MessageKind::Push => self.id.is_none() && self.route.is_some(),
            MessageKind::Response => self.id.is_some(),
        };

        if ok {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessage(format!(
                "{:?} with id={:?} route={:?}",
                self.kind, self.id, self.route
            )))
        }
    }
}

/// Error payload of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Application error code (e.g. `PIT-404`)
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ErrorBody {
    /// Create an error body.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    /// CBOR-encode the error body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Decode an error body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_survives_packet_wrapping() {
        let message = Message::request(7, "connector.entry", b"{}".to_vec());
        let packet = message.clone().into_packet().unwrap();

        assert_eq!(packet.kind, PacketType::Data);
        assert_eq!(Message::from_packet(&packet).unwrap(), message);
    }

    #[test]
    fn notify_omits_id() {
        let message = Message::notify("chat.send", b"hi".to_vec());
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Notify);
        assert_eq!(decoded.id, None);
    }

    #[test]
    fn error_response_exposes_body() {
        let err = ErrorBody::new("PIT-404", "route not found");
        let message = Message::error_response(3, &err).unwrap();
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();

        assert!(decoded.error);
        assert_eq!(decoded.error_body(), Some(err));
    }

    #[test]
    fn request_without_route_is_invalid() {
        let bogus = Message {
            kind: MessageKind::Request,
            id: Some(1),
            route: None,
            body: Vec::new(),
            error: false,
        };
        let bytes = bogus.encode().unwrap();

        assert!(matches!(Message::decode(&bytes), Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn from_packet_rejects_non_data() {
        let packet = Packet::empty(PacketType::Heartbeat);
        assert!(matches!(
            Message::from_packet(&packet),
            Err(ProtocolError::UnexpectedPacket { actual: PacketType::Heartbeat, .. })
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(Message::decode(&[0xFF, 0x00, 0x13]), Err(ProtocolError::CborDecode(_))));
    }
}
