//! Broker to client responses.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ErrorCode;
use crate::message::Message;
use crate::protocol::packet::{PacketBody, PacketType};
use crate::protocol::queries::empty_packet;
use crate::protocol::wire::{WireRead, WireWrite};
use crate::protocol::ProtocolResult;

/// Protocol revision announced by the broker.
pub const PROTOCOL_VERSION: i32 = 1;

/// Accepts a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionResponse {
    /// Protocol revision spoken by the broker
    pub protocol_version: i32,
}

impl Default for OpenConnectionResponse {
    fn default() -> Self {
        Self { protocol_version: PROTOCOL_VERSION }
    }
}

impl PacketBody for OpenConnectionResponse {
    const PACKET_TYPE: PacketType = PacketType::OpenConnectionResponse;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.protocol_version);
        Ok(())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { protocol_version: buf.read_i32()? })
    }
}

/// Answer to a keep-alive ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingResponse;

/// Session created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateSessionResponse;

/// Session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseSessionResponse;

/// Message accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutResponse;

/// Acknowledgement applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcknowledgeResponse;

/// Transaction committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitResponse;

/// Transaction rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackResponse;

/// Browser opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateBrowserResponse;

/// Browser closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseBrowserResponse;

empty_packet!(PingResponse);
empty_packet!(CreateSessionResponse);
empty_packet!(CloseSessionResponse);
empty_packet!(PutResponse);
empty_packet!(AcknowledgeResponse);
empty_packet!(CommitResponse);
empty_packet!(RollbackResponse);
empty_packet!(CreateBrowserResponse);
empty_packet!(CloseBrowserResponse);

fn put_optional_message(buf: &mut BytesMut, message: Option<&Message>) -> ProtocolResult<()> {
    match message {
        Some(m) => {
            buf.put_flag(true);
            m.serialize_to(buf)
        },
        None => {
            buf.put_flag(false);
            Ok(())
        },
    }
}

fn read_optional_message(buf: &mut Bytes) -> ProtocolResult<Option<Message>> {
    if buf.read_flag()? {
        Message::unserialize_from(buf).map(Some)
    } else {
        Ok(None)
    }
}

/// Result of a get; `None` when the destination had nothing available.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetResponse {
    /// Delivered message, if any
    pub message: Option<Message>,
}

impl PacketBody for GetResponse {
    const PACKET_TYPE: PacketType = PacketType::GetResponse;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        put_optional_message(buf, self.message.as_ref())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { message: read_optional_message(buf)? })
    }
}

/// Next message of a browser; `None` once the cursor is exhausted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BrowserFetchResponse {
    /// Browsed message, if any
    pub message: Option<Message>,
}

impl PacketBody for BrowserFetchResponse {
    const PACKET_TYPE: PacketType = PacketType::BrowserFetchResponse;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        put_optional_message(buf, self.message.as_ref())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { message: read_optional_message(buf)? })
    }
}

/// Number of messages held by a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizeResponse {
    /// Message count
    pub size: i32,
}

impl PacketBody for QueueSizeResponse {
    const PACKET_TYPE: PacketType = PacketType::QueueSizeResponse;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.size);
        Ok(())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { size: buf.read_i32()? })
    }
}

/// Failure answer to any response-expecting query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Stable error code, see [`ErrorCode`]
    pub code: String,
    /// Human readable description
    pub message: String,
}

impl ErrorResponse {
    /// Build an error response from a taxonomy code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.as_str().to_owned(), message: message.into() }
    }

    /// Resolve the code; unknown codes map to [`ErrorCode::InternalError`].
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(&self.code).unwrap_or(ErrorCode::InternalError)
    }
}

impl PacketBody for ErrorResponse {
    const PACKET_TYPE: PacketType = PacketType::ErrorResponse;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_utf(&self.code)?;
        buf.put_utf(&self.message)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { code: buf.read_utf()?, message: buf.read_utf()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DestinationRef;
    use crate::protocol::packet::{Packet, PacketKind, PacketSerializer};

    #[test]
    fn test_get_response_empty_and_full() {
        for message in [None, Some(Message::new(DestinationRef::queue("q")))] {
            let packet = Packet::new(GetResponse { message: message.clone() });
            let bytes = PacketSerializer::to_bytes(&packet).unwrap();
            let decoded = PacketSerializer::unserialize(bytes).unwrap();
            assert_eq!(decoded.kind, PacketKind::GetResponse(GetResponse { message }));
        }
    }

    #[test]
    fn test_error_response_code() {
        let response = ErrorResponse::new(ErrorCode::StoreFull, "no free block");
        assert_eq!(response.error_code(), ErrorCode::StoreFull);

        let unknown = ErrorResponse { code: "WHATEVER".into(), message: String::new() };
        assert_eq!(unknown.error_code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_open_connection_default_version() {
        assert_eq!(OpenConnectionResponse::default().protocol_version, PROTOCOL_VERSION);
    }
}
