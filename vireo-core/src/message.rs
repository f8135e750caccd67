//! Message model carried by packets and persisted by destination stores.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::protocol::wire::{WireRead, WireWrite};
use crate::protocol::{ProtocolError, ProtocolResult};

/// Default message priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Highest valid message priority.
pub const MAX_PRIORITY: u8 = 9;

/// Kind of destination a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DestinationKind {
    /// Point-to-point queue.
    Queue = 1,
    /// Publish/subscribe topic.
    Topic = 2,
}

impl DestinationKind {
    fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::Queue),
            2 => Ok(Self::Topic),
            other => Err(ProtocolError::invalid_field("destination_kind", other.to_string())),
        }
    }
}

/// Reference to a named destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationRef {
    /// Destination name
    pub name: String,
    /// Destination kind
    pub kind: DestinationKind,
}

impl DestinationRef {
    /// Reference a queue by name.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: DestinationKind::Queue }
    }

    /// Reference a topic by name.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: DestinationKind::Topic }
    }

    pub(crate) fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_u8(self.kind as u8);
        buf.put_utf(&self.name)
    }

    pub(crate) fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        let kind = DestinationKind::from_u8(buf.read_u8()?)?;
        let name = buf.read_utf()?;
        Ok(Self { name, kind })
    }
}

impl fmt::Display for DestinationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue://{}", self.name),
            DestinationKind::Topic => write!(f, "topic://{}", self.name),
        }
    }
}

/// Delivery mode of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Kept in memory only.
    NonPersistent = 1,
    /// Written to the destination store.
    #[default]
    Persistent = 2,
}

impl DeliveryMode {
    fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::NonPersistent),
            2 => Ok(Self::Persistent),
            other => Err(ProtocolError::invalid_field("delivery_mode", other.to_string())),
        }
    }
}

/// Typed message property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Boolean property
    Bool(bool),
    /// 8-bit integer property
    Byte(i8),
    /// 16-bit integer property
    Short(i16),
    /// 32-bit integer property
    Int(i32),
    /// 64-bit integer property
    Long(i64),
    /// Single precision property
    Float(f32),
    /// Double precision property
    Double(f64),
    /// String property
    String(String),
}

impl PropertyValue {
    fn tag(&self) -> u8 {
        match self {
            Self::Bool(_) => 1,
            Self::Byte(_) => 2,
            Self::Short(_) => 3,
            Self::Int(_) => 4,
            Self::Long(_) => 5,
            Self::Float(_) => 6,
            Self::Double(_) => 7,
            Self::String(_) => 8,
        }
    }

    fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_u8(self.tag());
        match self {
            Self::Bool(v) => buf.put_flag(*v),
            Self::Byte(v) => buf.put_i8(*v),
            Self::Short(v) => buf.put_i16(*v),
            Self::Int(v) => buf.put_i32(*v),
            Self::Long(v) => buf.put_i64(*v),
            Self::Float(v) => buf.put_f32(*v),
            Self::Double(v) => buf.put_f64(*v),
            Self::String(v) => buf.put_utf(v)?,
        }
        Ok(())
    }

    fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        Ok(match buf.read_u8()? {
            1 => Self::Bool(buf.read_flag()?),
            2 => Self::Byte(i8::from_be_bytes([buf.read_u8()?])),
            3 => Self::Short(buf.read_i16()?),
            4 => Self::Int(buf.read_i32()?),
            5 => Self::Long(buf.read_i64()?),
            6 => Self::Float(buf.read_f32()?),
            7 => Self::Double(buf.read_f64()?),
            8 => Self::String(buf.read_utf()?),
            other => {
                return Err(ProtocolError::invalid_field("property_type", other.to_string()))
            },
        })
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Short(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

/// A broker message: routing headers, typed properties and an opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique message identifier
    pub id: String,
    /// Destination the message was sent to
    pub destination: DestinationRef,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Destination replies should be sent to
    pub reply_to: Option<DestinationRef>,
    /// Application message type
    pub message_type: Option<String>,
    /// Priority, 0 (lowest) to 9 (highest)
    pub priority: u8,
    /// Persistence requirement
    pub delivery_mode: DeliveryMode,
    /// Send time in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Expiration time in milliseconds since the Unix epoch, 0 for never
    pub expiration: i64,
    /// Set once the message has been delivered and rolled back
    pub redelivered: bool,
    /// Typed application properties
    pub properties: BTreeMap<String, PropertyValue>,
    /// Message body
    pub body: Option<Bytes>,
}

impl Message {
    /// Create a persistent message with a fresh identifier.
    #[must_use]
    pub fn new(destination: DestinationRef) -> Self {
        Self {
            id: format!("ID:{}", Uuid::new_v4()),
            destination,
            correlation_id: None,
            reply_to: None,
            message_type: None,
            priority: DEFAULT_PRIORITY,
            delivery_mode: DeliveryMode::Persistent,
            timestamp: now_millis(),
            expiration: 0,
            redelivered: false,
            properties: BTreeMap::new(),
            body: None,
        }
    }

    /// Look up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Check whether the message expired at the given time.
    #[must_use]
    pub const fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration > 0 && self.expiration <= now_millis
    }

    /// Serialize all fields in wire order.
    ///
    /// # Errors
    /// Returns an error if a string field is too long to encode.
    pub fn serialize_to(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_utf(&self.id)?;
        self.destination.serialize_to(buf)?;
        buf.put_nullable_utf(self.correlation_id.as_deref())?;
        match &self.reply_to {
            Some(reply_to) => {
                buf.put_flag(true);
                reply_to.serialize_to(buf)?;
            },
            None => buf.put_flag(false),
        }
        buf.put_nullable_utf(self.message_type.as_deref())?;
        buf.put_u8(self.priority);
        buf.put_u8(self.delivery_mode as u8);
        buf.put_i64(self.timestamp);
        buf.put_i64(self.expiration);
        buf.put_flag(self.redelivered);

        let count = i32::try_from(self.properties.len())
            .map_err(|_| ProtocolError::encoding("too many properties"))?;
        buf.put_i32(count);
        for (name, value) in &self.properties {
            buf.put_utf(name)?;
            value.serialize_to(buf)?;
        }

        buf.put_nullable_byte_array(self.body.as_deref())
    }

    /// Parse a message previously written by [`Message::serialize_to`].
    ///
    /// # Errors
    /// Returns an error if the buffer is truncated or a field is invalid.
    pub fn unserialize_from(buf: &mut Bytes) -> ProtocolResult<Self> {
        let id = buf.read_utf()?;
        let destination = DestinationRef::unserialize_from(buf)?;
        let correlation_id = buf.read_nullable_utf()?;
        let reply_to =
            if buf.read_flag()? { Some(DestinationRef::unserialize_from(buf)?) } else { None };
        let message_type = buf.read_nullable_utf()?;
        let priority = buf.read_u8()?;
        if priority > MAX_PRIORITY {
            return Err(ProtocolError::invalid_field("priority", priority.to_string()));
        }
        let delivery_mode = DeliveryMode::from_u8(buf.read_u8()?)?;
        let timestamp = buf.read_i64()?;
        let expiration = buf.read_i64()?;
        let redelivered = buf.read_flag()?;

        let count = buf.read_i32()?;
        if count < 0 {
            return Err(ProtocolError::invalid_field("property_count", count.to_string()));
        }
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let name = buf.read_utf()?;
            let value = PropertyValue::unserialize_from(buf)?;
            properties.insert(name, value);
        }

        let body = buf.read_nullable_byte_array()?;

        Ok(Self {
            id,
            destination,
            correlation_id,
            reply_to,
            message_type,
            priority,
            delivery_mode,
            timestamp,
            expiration,
            redelivered,
            properties,
            body,
        })
    }

    /// Encode the message on its own, without a packet envelope.
    ///
    /// # Errors
    /// Returns an error if a string field is too long to encode.
    pub fn to_bytes(&self) -> ProtocolResult<Bytes> {
        let mut buf = BytesMut::with_capacity(128 + self.body.as_ref().map_or(0, Bytes::len));
        self.serialize_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a message written by [`Message::to_bytes`].
    ///
    /// # Errors
    /// Returns an error if the bytes do not hold exactly one message.
    pub fn from_bytes(bytes: Bytes) -> ProtocolResult<Self> {
        let mut buf = bytes;
        let message = Self::unserialize_from(&mut buf)?;
        if !buf.is_empty() {
            return Err(ProtocolError::TrailingData { packet_type: "Message", remaining: buf.len() });
        }
        Ok(message)
    }
}

/// Builder for [`Message`] values.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Start building a message for the given destination.
    #[must_use]
    pub fn new(destination: DestinationRef) -> Self {
        Self { message: Message::new(destination) }
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.message.body = Some(body.into());
        self
    }

    /// Set the correlation identifier.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.message.correlation_id = Some(id.into());
        self
    }

    /// Set the reply destination.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: DestinationRef) -> Self {
        self.message.reply_to = Some(reply_to);
        self
    }

    /// Set the application message type.
    #[must_use]
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message.message_type = Some(message_type.into());
        self
    }

    /// Set the priority, clamped to the valid range.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.message.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub const fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.message.delivery_mode = mode;
        self
    }

    /// Set the absolute expiration time.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: i64) -> Self {
        self.message.expiration = expiration;
        self
    }

    /// Add a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.message.properties.insert(name.into(), value);
        self
    }

    /// Finish the message.
    #[must_use]
    pub fn build(self) -> Message {
        self.message
    }
}

/// Current wall clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
