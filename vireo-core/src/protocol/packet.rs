//! Packet envelope, type tags and the two-step serializer.
//!
//! Wire layout of one packet body (the 4-byte frame length is added by the
//! transport):
//!
//! ```text
//! Offset | Size | Field
//! -------|------|---------------------------
//!   0    |  1   | Packet type tag
//!   1    |  4   | Endpoint id (routing)
//!   5    |  4   | Correlation id (routing)
//!   9    |  ?   | Type specific fields
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::notifications::MessageNotification;
use crate::protocol::queries::{
    AcknowledgeQuery, BrowserFetchQuery, CloseBrowserQuery, CloseSessionQuery, CommitQuery,
    CreateBrowserQuery, CreateSessionQuery, GetQuery, OpenConnectionQuery, PingQuery, PutQuery,
    QueueSizeQuery, RollbackMessageQuery, RollbackQuery,
};
use crate::protocol::responses::{
    AcknowledgeResponse, BrowserFetchResponse, CloseBrowserResponse, CloseSessionResponse,
    CommitResponse, CreateBrowserResponse, CreateSessionResponse, ErrorResponse, GetResponse,
    OpenConnectionResponse, PingResponse, PutResponse, QueueSizeResponse, RollbackResponse,
};
use crate::protocol::wire::WireRead;
use crate::protocol::{ProtocolError, ProtocolResult};

/// Size of the envelope preceding type specific fields.
pub const PACKET_HEADER_SIZE: usize = 9;

/// First type code of the response range.
const RESPONSE_RANGE_START: u8 = 0x40;

/// First type code of the notification range.
const NOTIFICATION_RANGE_START: u8 = 0x80;

/// Behavior shared by every concrete packet shape.
pub trait PacketBody: Sized {
    /// Type tag written ahead of the body.
    const PACKET_TYPE: PacketType;

    /// Write the type specific fields.
    ///
    /// # Errors
    /// Returns an error if a field cannot be encoded.
    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()>;

    /// Read the type specific fields; exact inverse of [`PacketBody::serialize_to`].
    ///
    /// # Errors
    /// Returns an error if the body is truncated or holds invalid values.
    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self>;
}

macro_rules! packet_kinds {
    ($($variant:ident = $code:literal),* $(,)?) => {
        /// Closed enumeration of packet type tags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum PacketType {
            $(
                #[allow(missing_docs)]
                $variant = $code,
            )*
        }

        impl PacketType {
            /// Resolve a wire tag.
            ///
            /// # Errors
            /// Returns [`ProtocolError::UnsupportedPacketType`] for unknown tags.
            pub const fn from_u8(value: u8) -> ProtocolResult<Self> {
                match value {
                    $($code => Ok(Self::$variant),)*
                    _ => Err(ProtocolError::UnsupportedPacketType { packet_type: value }),
                }
            }

            /// Human readable name of the packet type.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)*
                }
            }
        }

        /// Concrete packet payload, one variant per type tag.
        #[derive(Debug, Clone, PartialEq)]
        pub enum PacketKind {
            $(
                #[allow(missing_docs)]
                $variant($variant),
            )*
        }

        impl PacketKind {
            /// Type tag of this payload.
            #[must_use]
            pub const fn packet_type(&self) -> PacketType {
                match self {
                    $(Self::$variant(_) => PacketType::$variant,)*
                }
            }

            fn serialize_body(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
                match self {
                    $(Self::$variant(p) => p.serialize_to(buf),)*
                }
            }

            fn unserialize_body(packet_type: PacketType, buf: &mut Bytes) -> ProtocolResult<Self> {
                match packet_type {
                    $(PacketType::$variant => $variant::unserialize_from(buf).map(Self::$variant),)*
                }
            }
        }

        $(
            impl From<$variant> for PacketKind {
                fn from(packet: $variant) -> Self {
                    Self::$variant(packet)
                }
            }
        )*
    };
}

packet_kinds! {
    OpenConnectionQuery = 0x01,
    PingQuery = 0x02,
    CreateSessionQuery = 0x03,
    CloseSessionQuery = 0x04,
    PutQuery = 0x05,
    GetQuery = 0x06,
    AcknowledgeQuery = 0x07,
    CommitQuery = 0x08,
    RollbackQuery = 0x09,
    RollbackMessageQuery = 0x0A,
    CreateBrowserQuery = 0x0B,
    BrowserFetchQuery = 0x0C,
    CloseBrowserQuery = 0x0D,
    QueueSizeQuery = 0x0E,

    OpenConnectionResponse = 0x40,
    PingResponse = 0x41,
    CreateSessionResponse = 0x42,
    CloseSessionResponse = 0x43,
    PutResponse = 0x44,
    GetResponse = 0x45,
    AcknowledgeResponse = 0x46,
    CommitResponse = 0x47,
    RollbackResponse = 0x48,
    CreateBrowserResponse = 0x49,
    BrowserFetchResponse = 0x4A,
    CloseBrowserResponse = 0x4B,
    QueueSizeResponse = 0x4C,
    ErrorResponse = 0x7F,

    MessageNotification = 0x80,
}

impl PacketType {
    /// Raw wire tag.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Queries are sent by clients to the broker.
    #[must_use]
    pub const fn is_query(self) -> bool {
        self.as_u8() < RESPONSE_RANGE_START
    }

    /// Responses answer a response-expecting query.
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.as_u8() >= RESPONSE_RANGE_START && self.as_u8() < NOTIFICATION_RANGE_START
    }

    /// Notifications are pushed by the broker without a matching query.
    #[must_use]
    pub const fn is_notification(self) -> bool {
        self.as_u8() >= NOTIFICATION_RANGE_START
    }

    /// Whether the sender waits for a response packet.
    ///
    /// Pings and message-level rollbacks are fire-and-forget.
    #[must_use]
    pub const fn is_response_expected(self) -> bool {
        self.is_query() && !matches!(self, Self::PingQuery | Self::RollbackMessageQuery)
    }
}

/// One protocol packet: routing envelope plus typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Logical endpoint the packet belongs to on a shared connection
    pub endpoint_id: i32,
    /// Request/response correlation identifier
    pub correlation_id: i32,
    /// Typed payload
    pub kind: PacketKind,
}

impl Packet {
    /// Create a packet with empty routing information.
    #[must_use]
    pub fn new(kind: impl Into<PacketKind>) -> Self {
        Self { endpoint_id: 0, correlation_id: 0, kind: kind.into() }
    }

    /// Create a packet with explicit routing information.
    #[must_use]
    pub fn with_routing(endpoint_id: i32, correlation_id: i32, kind: impl Into<PacketKind>) -> Self {
        Self { endpoint_id, correlation_id, kind: kind.into() }
    }

    /// Build the response to this packet, reusing its routing envelope.
    #[must_use]
    pub fn response(&self, kind: impl Into<PacketKind>) -> Self {
        Self::with_routing(self.endpoint_id, self.correlation_id, kind)
    }

    /// Type tag of the payload.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.kind.packet_type()
    }

    /// Whether the sender waits for a response packet.
    #[must_use]
    pub const fn is_response_expected(&self) -> bool {
        self.packet_type().is_response_expected()
    }
}

/// Two-step packet serializer: type tag first, then the variant's own fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketSerializer;

impl PacketSerializer {
    /// Append the packet (without frame length) to `buf`.
    ///
    /// # Errors
    /// Returns an error if a field cannot be encoded.
    pub fn serialize(packet: &Packet, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_u8(packet.packet_type().as_u8());
        buf.put_i32(packet.endpoint_id);
        buf.put_i32(packet.correlation_id);
        packet.kind.serialize_body(buf)
    }

    /// Serialize into a fresh buffer.
    ///
    /// # Errors
    /// Returns an error if a field cannot be encoded.
    pub fn to_bytes(packet: &Packet) -> ProtocolResult<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        Self::serialize(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse exactly one packet from `bytes`.
    ///
    /// # Errors
    /// Returns an error for unknown type tags, truncated or over-long bodies.
    pub fn unserialize(bytes: Bytes) -> ProtocolResult<Packet> {
        let mut buf = bytes;
        let packet_type = PacketType::from_u8(buf.read_u8()?)?;
        let endpoint_id = buf.read_i32()?;
        let correlation_id = buf.read_i32()?;
        let kind = PacketKind::unserialize_body(packet_type, &mut buf)?;
        if !buf.is_empty() {
            return Err(ProtocolError::TrailingData {
                packet_type: packet_type.name(),
                remaining: buf.len(),
            });
        }
        Ok(Packet { endpoint_id, correlation_id, kind })
    }
}
