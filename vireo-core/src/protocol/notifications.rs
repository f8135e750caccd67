//! Unsolicited broker to client packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::Message;
use crate::protocol::packet::{PacketBody, PacketType};
use crate::protocol::wire::WireRead;
use crate::protocol::ProtocolResult;

/// Pushes a message to an asynchronous consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageNotification {
    /// Session owning the consumer
    pub session_id: i32,
    /// Target consumer
    pub consumer_id: i32,
    /// Delivered message
    pub message: Message,
}

impl PacketBody for MessageNotification {
    const PACKET_TYPE: PacketType = PacketType::MessageNotification;

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_i32(self.session_id);
        buf.put_i32(self.consumer_id);
        self.message.serialize_to(buf)
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            session_id: buf.read_i32()?,
            consumer_id: buf.read_i32()?,
            message: Message::unserialize_from(buf)?,
        })
    }
}
