//! Client to broker queries.
//!
//! Session scoped queries always start with the session id so the broker can
//! route them before decoding the rest of the body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{DestinationRef, Message};
use crate::protocol::packet::{PacketBody, PacketType};
use crate::protocol::wire::{WireRead, WireWrite};
use crate::protocol::{ProtocolError, ProtocolResult};

/// Implements [`PacketBody`] for a packet without fields.
macro_rules! empty_packet {
    ($name:ident) => {
        impl PacketBody for $name {
            const PACKET_TYPE: PacketType = PacketType::$name;

            fn serialize_to(&self, _buf: &mut BytesMut) -> ProtocolResult<()> {
                Ok(())
            }

            fn unserialize_from(_buf: &mut Bytes) -> ProtocolResult<Self> {
                Ok(Self)
            }
        }
    };
}

/// Implements [`PacketBody`] for a packet carrying only a session id.
macro_rules! session_packet {
    ($name:ident) => {
        impl PacketBody for $name {
            const PACKET_TYPE: PacketType = PacketType::$name;

            fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
                buf.put_i32(self.session_id);
                Ok(())
            }

            fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
                Ok(Self { session_id: buf.read_i32()? })
            }
        }
    };
}

pub(crate) use empty_packet;

/// Message acknowledgement policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AcknowledgeMode {
    /// Messages are acknowledged as soon as they are delivered.
    #[default]
    Auto = 1,
    /// The client acknowledges messages explicitly.
    Client = 2,
    /// Lazy acknowledgement, duplicates tolerated.
    DupsOk = 3,
}

impl AcknowledgeMode {
    fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::Auto),
            2 => Ok(Self::Client),
            3 => Ok(Self::DupsOk),
            other => Err(ProtocolError::invalid_field("acknowledge_mode", other.to_string())),
        }
    }
}

/// First query of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpenConnectionQuery {
    /// Optional user name
    pub user_name: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Optional client identifier
    pub client_id: Option<String>,
}

impl PacketBody for OpenConnectionQuery {
    const PACKET_TYPE: PacketType = PacketType::OpenConnectionQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_nullable_utf(self.user_name.as_deref())?;
        buf.put_nullable_utf(self.password.as_deref())?;
        buf.put_nullable_utf(self.client_id.as_deref())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            user_name: buf.read_nullable_utf()?,
            password: buf.read_nullable_utf()?,
            client_id: buf.read_nullable_utf()?,
        })
    }
}

/// Keep-alive ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PingQuery;

empty_packet!(PingQuery);

/// Open a session on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateSessionQuery {
    /// Client assigned session id
    pub session_id: i32,
    /// Whether puts and acknowledgements are grouped into transactions
    pub transacted: bool,
    /// Acknowledgement policy
    pub acknowledge_mode: AcknowledgeMode,
}

impl PacketBody for CreateSessionQuery {
    const PACKET_TYPE: PacketType = PacketType::CreateSessionQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        buf.put_flag(self.transacted);
        buf.put_u8(self.acknowledge_mode as u8);
        Ok(())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            session_id: buf.read_i32()?,
            transacted: buf.read_flag()?,
            acknowledge_mode: AcknowledgeMode::from_u8(buf.read_u8()?)?,
        })
    }
}

/// Close a session, rolling back anything uncommitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSessionQuery {
    /// Session to close
    pub session_id: i32,
}

session_packet!(CloseSessionQuery);

/// Send a message to its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct PutQuery {
    /// Sending session
    pub session_id: i32,
    /// Message to store
    pub message: Message,
}

impl PacketBody for PutQuery {
    const PACKET_TYPE: PacketType = PacketType::PutQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        self.message.serialize_to(buf)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { session_id: buf.read_i32()?, message: Message::unserialize_from(buf)? })
    }
}

/// Receive the next available message of a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetQuery {
    /// Receiving session
    pub session_id: i32,
    /// Consumer within the session
    pub consumer_id: i32,
    /// Destination to read from
    pub destination: DestinationRef,
}

impl PacketBody for GetQuery {
    const PACKET_TYPE: PacketType = PacketType::GetQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        buf.put_i32(self.consumer_id);
        self.destination.serialize_to(buf)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            session_id: buf.read_i32()?,
            consumer_id: buf.read_i32()?,
            destination: DestinationRef::unserialize_from(buf)?,
        })
    }
}

/// Acknowledge delivered messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeQuery {
    /// Acknowledging session
    pub session_id: i32,
    /// Destination the messages came from
    pub destination: DestinationRef,
    /// Identifiers of the acknowledged messages
    pub message_ids: Vec<String>,
}

impl PacketBody for AcknowledgeQuery {
    const PACKET_TYPE: PacketType = PacketType::AcknowledgeQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        self.destination.serialize_to(buf)?;
        let count = i32::try_from(self.message_ids.len())
            .map_err(|_| ProtocolError::encoding("too many message ids"))?;
        buf.put_i32(count);
        for id in &self.message_ids {
            buf.put_utf(id)?;
        }
        Ok(())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        let session_id = buf.read_i32()?;
        let destination = DestinationRef::unserialize_from(buf)?;
        let count = buf.read_i32()?;
        let count = usize::try_from(count)
            .map_err(|_| ProtocolError::invalid_field("message_ids", format!("count {count}")))?;
        // Each id needs at least its 2-byte length prefix.
        buf.ensure(count.saturating_mul(2))?;
        let message_ids = (0..count).map(|_| buf.read_utf()).collect::<ProtocolResult<_>>()?;
        Ok(Self { session_id, destination, message_ids })
    }
}

/// Commit a transacted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitQuery {
    /// Session to commit
    pub session_id: i32,
}

session_packet!(CommitQuery);

/// Roll back a transacted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackQuery {
    /// Session to roll back
    pub session_id: i32,
}

session_packet!(RollbackQuery);

/// Return one delivered message to its destination. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackMessageQuery {
    /// Session holding the message
    pub session_id: i32,
    /// Destination of the message
    pub destination: DestinationRef,
    /// Message identifier
    pub message_id: String,
}

impl PacketBody for RollbackMessageQuery {
    const PACKET_TYPE: PacketType = PacketType::RollbackMessageQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        self.destination.serialize_to(buf)?;
        buf.put_utf(&self.message_id)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            session_id: buf.read_i32()?,
            destination: DestinationRef::unserialize_from(buf)?,
            message_id: buf.read_utf()?,
        })
    }
}

/// Open a non-destructive cursor over a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBrowserQuery {
    /// Owning session
    pub session_id: i32,
    /// Client assigned browser id
    pub browser_id: i32,
    /// Queue to browse
    pub destination: DestinationRef,
}

impl PacketBody for CreateBrowserQuery {
    const PACKET_TYPE: PacketType = PacketType::CreateBrowserQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        buf.put_i32(self.browser_id);
        self.destination.serialize_to(buf)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            session_id: buf.read_i32()?,
            browser_id: buf.read_i32()?,
            destination: DestinationRef::unserialize_from(buf)?,
        })
    }
}

/// Fetch the next message of a browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserFetchQuery {
    /// Owning session
    pub session_id: i32,
    /// Browser to advance
    pub browser_id: i32,
}

/// Close a browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseBrowserQuery {
    /// Owning session
    pub session_id: i32,
    /// Browser to close
    pub browser_id: i32,
}

macro_rules! browser_packet {
    ($name:ident) => {
        impl PacketBody for $name {
            const PACKET_TYPE: PacketType = PacketType::$name;

            fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
                buf.put_i32(self.session_id);
                buf.put_i32(self.browser_id);
                Ok(())
            }

            fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
                Ok(Self { session_id: buf.read_i32()?, browser_id: buf.read_i32()? })
            }
        }
    };
}

browser_packet!(BrowserFetchQuery);
browser_packet!(CloseBrowserQuery);

/// Ask for the number of messages held by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSizeQuery {
    /// Queue to inspect
    pub destination: DestinationRef,
}

impl PacketBody for QueueSizeQuery {
    const PACKET_TYPE: PacketType = PacketType::QueueSizeQuery;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        self.destination.serialize_to(buf)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self { destination: DestinationRef::unserialize_from(buf)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{Packet, PacketKind, PacketSerializer};

    fn roundtrip(packet: Packet) -> Packet {
        let bytes = PacketSerializer::to_bytes(&packet).unwrap();
        PacketSerializer::unserialize(bytes).unwrap()
    }

    #[test]
    fn test_session_id_comes_first() {
        let packet = Packet::new(CommitQuery { session_id: 0x0102_0304 });
        let bytes = PacketSerializer::to_bytes(&packet).unwrap();
        assert_eq!(&bytes[9..13], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_acknowledge_query_roundtrip() {
        let query = AcknowledgeQuery {
            session_id: 2,
            destination: DestinationRef::queue("orders"),
            message_ids: vec!["ID:1".into(), "ID:2".into()],
        };
        let decoded = roundtrip(Packet::with_routing(1, 42, query.clone()));
        assert_eq!(decoded.kind, PacketKind::AcknowledgeQuery(query));
        assert_eq!(decoded.correlation_id, 42);
    }

    #[test]
    fn test_acknowledge_query_bogus_count() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        DestinationRef::queue("q").serialize_to(&mut buf).unwrap();
        buf.put_i32(1_000_000);
        let mut bytes = buf.freeze();
        assert!(matches!(
            AcknowledgeQuery::unserialize_from(&mut bytes),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_put_query_carries_message() {
        let message = crate::message::MessageBuilder::new(DestinationRef::queue("orders"))
            .with_body(&b"hello"[..])
            .build();
        let decoded = roundtrip(Packet::new(PutQuery { session_id: 7, message: message.clone() }));
        match decoded.kind {
            PacketKind::PutQuery(put) => {
                assert_eq!(put.session_id, 7);
                assert_eq!(put.message, message);
            },
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_invalid_acknowledge_mode() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_u8(1);
        buf.put_u8(9);
        let mut bytes = buf.freeze();
        assert!(CreateSessionQuery::unserialize_from(&mut bytes).is_err());
    }
}
