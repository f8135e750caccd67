//! # Prelude
//!
//! Commonly used types of the Vireo core library.

pub use crate::{
    config::{BrokerConfig, DestinationDescriptor, StorageSyncMethod, TransportSettings},
    error::{Error, ErrorCode, Result},
    message::{DestinationRef, Message, MessageBuilder, PropertyValue},
    protocol::{Packet, PacketKind, PacketType},
    selector::MessageSelector,
    sync::SynchronizationBarrier,
    watchdog::{ActivityWatchdog, Clock},
};

pub use bytes::Bytes;
